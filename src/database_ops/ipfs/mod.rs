pub mod fetcher;
pub mod generator;

pub use fetcher::{BinaryFetch, RetryingFetcher};
pub use generator::{DocumentSource, GatewaySource, GenerateSummary, SourceGenerator};

/// `<gateway>/ipfs/<cid>`
pub fn gateway_url(gateway: &str, cid: &str) -> String {
    format!("{}/ipfs/{}", gateway.trim_end_matches('/'), cid.trim_matches('/'))
}

/// `<gateway>/ipfs/<cid>/<filename>`
pub fn gateway_file_url(gateway: &str, cid: &str, filename: &str) -> String {
    format!("{}/{}", gateway_url(gateway, cid), filename)
}
