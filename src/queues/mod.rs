//! Work queues.

pub mod ocr;
pub mod work;
