pub mod marshal;
pub mod optimization;
