//! Per-connection content-server session.

use rand_core::OsRng;
use sha1::{Digest, Sha1};
use steam_cm::{KeyExchange, SessionKey};

use crate::error::ContentError;
use crate::http::{HttpClient, HttpRequest, HttpResponse, AUTH_HEADER};
use crate::vdf;

/// `x-steam-auth` value for one request.
///
/// `req_counter` is the already incremented counter of the request.
pub fn auth_header(session_id: u64, req_counter: u64, key: &[u8], path: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(session_id.to_le_bytes());
    sha.update(req_counter.to_le_bytes());
    sha.update(key);
    sha.update(path.as_bytes());
    let hash = hex::encode_upper(sha.finalize());
    format!("sessionid={session_id};req-counter={req_counter};hash={hash};")
}

/// An initialized session with one content server.
#[derive(Debug)]
pub struct ContentServerConnection {
    host: String,
    key: SessionKey,
    session_id: u64,
    req_counter: u64,
    depot: Option<u32>,
}

impl ContentServerConnection {
    pub fn new(
        host: impl Into<String>,
        key: SessionKey,
        session_id: u64,
        req_counter: u64,
    ) -> Self {
        Self { host: host.into(), key, session_id, req_counter, depot: None }
    }

    /// Runs `/initsession/` against `host`.
    pub async fn init<H: HttpClient + ?Sized>(
        http: &H,
        host: &str,
        app_ticket: &[u8],
        exchange: &KeyExchange,
    ) -> Result<Self, ContentError> {
        let (key, wrapped_key) = exchange.generate(&mut OsRng)?;
        let ticket = key.encrypt(app_ticket);

        let url = format!("http://{host}/initsession/");
        let request = HttpRequest::post_form(
            url.as_str(),
            &[("sessionkey", wrapped_key.as_slice()), ("appticket", ticket.as_slice())],
        );
        log::debug!("initsession with {host}");
        let response = expect_ok(&url, http.request(request).await?)?;

        let (session_id, req_counter) = parse_init_response(&response.body)
            .map_err(|reason| ContentError::BadResponse { url, reason })?;
        log::info!("content server {host} ready: session {session_id}, counter {req_counter}");
        Ok(Self::new(host, key, session_id, req_counter))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn req_counter(&self) -> u64 {
        self.req_counter
    }

    /// Depot this connection is currently authorized for.
    pub fn depot(&self) -> Option<u32> {
        self.depot
    }

    /// Advances the request counter and signs `path` with it.
    pub fn next_auth(&mut self, path: &str) -> String {
        self.req_counter += 1;
        auth_header(self.session_id, self.req_counter, self.key.as_bytes(), path)
    }

    /// Authorizes this connection for `depot_id` with `/authdepot/`.
    pub async fn auth_depot<H: HttpClient + ?Sized>(
        &mut self,
        http: &H,
        depot_id: u32,
        app_ticket: &[u8],
    ) -> Result<(), ContentError> {
        let path = "/authdepot/";
        let ticket = self.key.encrypt(app_ticket);
        let url = format!("http://{}{}", self.host, path);
        let request = HttpRequest::post_form(url.as_str(), &[("appticket", ticket.as_slice())])
            .header(AUTH_HEADER, self.next_auth(path));

        expect_ok(&url, http.request(request).await?)?;
        log::debug!("{} authorized for depot {}", self.host, depot_id);
        self.depot = Some(depot_id);
        Ok(())
    }

    /// Fetches `/depot/{depot_id}{path}`.
    pub async fn get<H: HttpClient + ?Sized>(
        &mut self,
        http: &H,
        depot_id: u32,
        path: &str,
    ) -> Result<Vec<u8>, ContentError> {
        let path = format!("/depot/{depot_id}{path}");
        let url = format!("http://{}{}", self.host, path);
        let request = HttpRequest::get(url.as_str()).header(AUTH_HEADER, self.next_auth(&path));
        Ok(expect_ok(&url, http.request(request).await?)?.body)
    }
}

fn expect_ok(url: &str, response: HttpResponse) -> Result<HttpResponse, ContentError> {
    if response.is_success() {
        Ok(response)
    } else {
        Err(ContentError::Status { url: url.to_string(), status: response.status })
    }
}

fn parse_init_response(body: &[u8]) -> Result<(u64, u64), String> {
    let text = std::str::from_utf8(body).map_err(|err| err.to_string())?;
    let root = vdf::parse(text).map_err(|err| err.to_string())?;
    let response = root.require_object("response").map_err(|err| err.to_string())?;

    let session_id = response.require_str("sessionid").map_err(|err| err.to_string())?;
    let req_counter = response.require_str("req-counter").map_err(|err| err.to_string())?;
    let session_id = session_id.parse::<u64>().map_err(|err| format!("sessionid: {err}"))?;
    let req_counter = req_counter.parse::<u64>().map_err(|err| format!("req-counter: {err}"))?;
    Ok((session_id, req_counter))
}
