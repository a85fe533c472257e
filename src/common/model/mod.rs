pub mod init;
pub mod models;
pub mod rnn;
