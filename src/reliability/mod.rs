pub mod retry;
pub mod writer;
