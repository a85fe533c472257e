pub mod checkpoint;
pub mod evaluation;
pub mod replica;
