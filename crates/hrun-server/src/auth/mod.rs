//! Authorization: which programs a client may ask the server to run.

pub mod allow_list;

pub use allow_list::AllowList;
