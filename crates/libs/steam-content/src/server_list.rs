//! Content-server discovery through the directory's `/serverlist/` endpoint.

use crate::error::ContentError;
use crate::http::{HttpClient, HttpRequest};
use crate::vdf::{self, VdfObject};

/// Asks the server directory for content servers near `cell_id`.
///
/// Returns the `host` of every `CS` entry in listed order.
pub async fn fetch_server_list<H: HttpClient + ?Sized>(
    http: &H,
    host: &str,
    port: u16,
    cell_id: u32,
) -> Result<Vec<String>, ContentError> {
    let url = format!("http://{host}:{port}/serverlist/{cell_id}/6/");
    let response = http.request(HttpRequest::get(url.as_str())).await?;
    if !response.is_success() {
        return Err(ContentError::Status { url, status: response.status });
    }

    let text = std::str::from_utf8(&response.body)
        .map_err(|err| ContentError::BadResponse { url: url.clone(), reason: err.to_string() })?;
    let root = vdf::parse(text)?;
    let servers = content_servers(root.require_object("serverlist")?);
    log::debug!("{url}: {} content servers", servers.len());
    Ok(servers)
}

fn content_servers(list: &VdfObject) -> Vec<String> {
    list.iter()
        .filter_map(|(_, entry)| entry.as_object())
        .filter(|entry| entry.get_str("type") == Some("CS"))
        .filter_map(|entry| entry.get_str("host"))
        .map(str::to_string)
        .collect()
}
