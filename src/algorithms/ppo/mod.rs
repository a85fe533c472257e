pub mod buffer;
pub mod collector;
pub mod loss;
pub mod train;
