use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use nestfeed_core::models::{NewProxy, ProxyProtocol};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct ProxyRow {
    address: String,
    port: u16,
    protocol: String,
    username: Option<String>,
    password: Option<String>,
    country: Option<String>,
}

impl ProxyRow {
    fn into_new_proxy(self) -> Result<NewProxy> {
        let protocol: ProxyProtocol = self.protocol.parse().map_err(|e: String| anyhow!(e))?;
        let mut proxy = NewProxy::new(self.address, self.port, protocol);
        if let Some(username) = self.username.filter(|u| !u.is_empty()) {
            proxy = proxy.with_credentials(username, self.password.unwrap_or_default());
        }
        if let Some(country) = self.country.filter(|c| !c.is_empty()) {
            proxy = proxy.with_country(country);
        }
        Ok(proxy)
    }
}

/// Parse `address,port,protocol,username,password,country` rows (header required).
pub fn read_proxies<R: Read>(reader: R) -> Result<Vec<NewProxy>> {
    let mut csv = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);

    csv.deserialize::<ProxyRow>()
        .enumerate()
        .map(|(i, row)| {
            // Line 1 is the header.
            let line = i + 2;
            row.with_context(|| format!("Invalid proxy row on line {line}"))?
                .into_new_proxy()
                .with_context(|| format!("Invalid proxy row on line {line}"))
        })
        .collect()
}

pub fn load_proxies(path: &Path) -> Result<Vec<NewProxy>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open proxy file: {}", path.display()))?;
    read_proxies(file)
}
