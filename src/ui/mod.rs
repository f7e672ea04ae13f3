pub mod chat;
pub mod fragment;
pub mod listing;
pub mod util;
