use nestfeed_core::error::AppError;
use nestfeed_core::models::{ScrapeScope, TransactionType};
use nestfeed_core::traits::ListingSource;
use url::Url;

/// Listing origin addressed by a base URL.
///
/// Searches go to `{base}/search?type=<rent|sale>&page=N`, with
/// `&scope=recent` for recent-only scrapes. Single listings live at
/// `{base}/listings/{external_id}`.
#[derive(Debug, Clone)]
pub struct HttpListingSource {
    base: Url,
}

impl HttpListingSource {
    pub fn new(base: &str) -> Result<Self, AppError> {
        let base = Url::parse(base)
            .map_err(|e| AppError::ConfigError(format!("Invalid source URL '{base}': {e}")))?;
        if base.cannot_be_a_base() || !matches!(base.scheme(), "http" | "https") {
            return Err(AppError::ConfigError(format!(
                "Source URL '{base}' must be an http(s) URL"
            )));
        }
        Ok(Self { base })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    fn with_path(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        url.set_query(None);
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }
}

impl ListingSource for HttpListingSource {
    fn search_url(&self, transaction: TransactionType, scope: ScrapeScope, page: u32) -> String {
        let mut url = self.with_path(&["search"]);
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("type", transaction.as_str())
                .append_pair("page", &page.to_string());
            if scope == ScrapeScope::Recent {
                query.append_pair("scope", "recent");
            }
        }
        url.into()
    }

    fn listing_url(&self, external_id: &str) -> String {
        self.with_path(&["listings", external_id]).into()
    }
}
