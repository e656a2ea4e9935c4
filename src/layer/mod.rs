pub mod entry;
pub mod reproducible;
pub mod tar_stream;
