mod producer_service;

pub use producer_service::*;
