pub mod extractor;
pub mod source;
pub mod transport;

pub use extractor::JsonListingExtractor;
pub use source::HttpListingSource;
pub use transport::ReqwestTransport;
