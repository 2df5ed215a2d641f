pub mod http;
pub mod reliable;

pub use http::HttpProvider;
pub use reliable::ReliableProvider;
