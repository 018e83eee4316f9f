use std::fs::{self, File};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use log::{debug, info, trace, warn};
use reqwest::Url;
use reqwest::blocking::{Client, Response};
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{
    ACCEPT, ACCEPT_LANGUAGE, CONTENT_DISPOSITION, CONTENT_TYPE, HeaderMap, HeaderValue, REFERER,
};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::fetch::session::{BrowserSession, Cookie, SessionError, SessionResult};
use crate::fetch::truncate_error;

const ACCEPT_PAGES: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/*,*/*;q=0.8";

/// Browser session over a cookie-keeping HTTP client.
///
/// File responses are written in the background, first under a temporary
/// name and then renamed, the same way a browser saves a download. Every
/// save gets its own temporary name, so a retry never writes into a file an
/// earlier, still running save owns.
pub(crate) struct HttpSession {
    client: Option<Client>,
    jar: Arc<Jar>,
    download_dir: PathBuf,
    temp_suffix: String,
    current_url: Option<Url>,
    content: String,
    saves_in_flight: Arc<AtomicUsize>,
}

impl HttpSession {
    pub(crate) fn new(config: &SessionConfig, download_dir: PathBuf, temp_suffix: String) -> SessionResult<Self> {
        let jar = Arc::new(Jar::default());

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_PAGES));
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));

        let client = Client::builder()
            .cookie_provider(Arc::clone(&jar))
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .timeout(config.request_timeout())
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| SessionError::Transport(e.to_string()))?;

        trace!("HTTP session created, saving into {}", download_dir.display());
        Ok(Self {
            client: Some(client),
            jar,
            download_dir,
            temp_suffix,
            current_url: None,
            content: String::new(),
            saves_in_flight: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Starts writing `response` into the download directory on its own thread.
    fn save_in_background(&self, url: &Url, mut response: Response) -> SessionResult<()> {
        let name = filename_from_disposition(response.headers().get(CONTENT_DISPOSITION))
            .or_else(|| filename_from_url(url))
            .ok_or_else(|| SessionError::Save(format!("no file name for {}", url)))?;

        let final_path = self.download_dir.join(&name);
        let temp_path = self.download_dir.join(temp_file_name(&name, &self.temp_suffix));
        let mut file = File::create(&temp_path)
            .map_err(|e| SessionError::Save(format!("{}: {}", temp_path.display(), e)))?;

        let in_flight = Arc::clone(&self.saves_in_flight);
        in_flight.fetch_add(1, Ordering::SeqCst);
        debug!("Saving {} in the background", name);

        let spawned = thread::Builder::new()
            .name(format!("save-{}", name))
            .spawn(move || {
                let written = response
                    .copy_to(&mut file)
                    .map_err(|e| e.to_string())
                    .and_then(|_| file.sync_all().map_err(|e| e.to_string()));
                drop(file);
                let result = written
                    .and_then(|_| fs::rename(&temp_path, &final_path).map_err(|e| e.to_string()));

                match result {
                    Ok(()) => trace!("Saved {}", final_path.display()),
                    Err(err) => {
                        warn!("Saving {} failed: {}", final_path.display(), truncate_error(&err));
                        let _ = fs::remove_file(&temp_path);
                    }
                }
                in_flight.fetch_sub(1, Ordering::SeqCst);
            });

        spawned.map(|_| ()).map_err(|e| {
            self.saves_in_flight.fetch_sub(1, Ordering::SeqCst);
            SessionError::Save(e.to_string())
        })
    }
}

impl BrowserSession for HttpSession {
    fn navigate(&mut self, url: &str) -> SessionResult<()> {
        let client = self.client.as_ref().ok_or(SessionError::Closed)?;
        let parsed = Url::parse(url).map_err(|e| SessionError::Transport(format!("{}: {}", url, e)))?;

        let mut request = client.get(parsed.clone());
        if let Some(referer) = &self.current_url {
            request = request.header(REFERER, referer.as_str());
        }
        let response = request
            .send()
            .map_err(|e| SessionError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            // Keep the body so challenge markers can still be inspected.
            self.content = response.text().unwrap_or_default();
            self.current_url = Some(parsed);
            return Err(SessionError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        if is_file_response(response.headers()) {
            self.content.clear();
            self.save_in_background(&parsed, response)
        } else {
            self.content = response
                .text()
                .map_err(|e| SessionError::Transport(e.to_string()))?;
            self.current_url = Some(parsed);
            Ok(())
        }
    }

    fn current_content(&self) -> SessionResult<String> {
        if self.client.is_none() {
            return Err(SessionError::Closed);
        }
        Ok(self.content.clone())
    }

    fn cookies(&self) -> Vec<Cookie> {
        let Some(url) = &self.current_url else {
            return Vec::new();
        };
        let domain = url.host_str().unwrap_or_default();
        self.jar
            .cookies(url)
            .and_then(|header| header.to_str().ok().map(|h| parse_cookie_header(h, domain)))
            .unwrap_or_default()
    }

    fn quit(&mut self) {
        if self.client.take().is_some() {
            let pending = self.saves_in_flight.load(Ordering::SeqCst);
            if pending > 0 {
                warn!("Closing session with {} downloads still being written", pending);
            }
            info!("HTTP session closed");
        }
    }
}

impl Drop for HttpSession {
    fn drop(&mut self) {
        self.quit();
    }
}

fn is_file_response(headers: &HeaderMap) -> bool {
    let attachment = headers
        .get(CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().starts_with("attachment"));
    let file_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| {
            let v = v.to_ascii_lowercase();
            v.starts_with("image/") || v.starts_with("application/octet-stream")
        });
    attachment || file_type
}

/// `<name>.<unique>.<suffix>`: distinct per call, still ending in `suffix`.
fn temp_file_name(name: &str, suffix: &str) -> String {
    let unique = Uuid::new_v4().simple().to_string();
    format!("{}.{}{}", name, &unique[..8], suffix)
}

fn filename_from_disposition(header: Option<&HeaderValue>) -> Option<String> {
    let value = header?.to_str().ok()?;
    let mut plain = None;
    for part in value.split(';').map(str::trim) {
        if let Some(encoded) = part.strip_prefix("filename*=") {
            // RFC 5987: charset'lang'percent-encoded
            let encoded = encoded.rsplit('\'').next().unwrap_or(encoded);
            if let Ok(decoded) = urlencoding::decode(encoded) {
                return non_empty(sanitize_filename(&decoded));
            }
        } else if let Some(name) = part.strip_prefix("filename=") {
            plain = non_empty(sanitize_filename(name.trim_matches('"')));
        }
    }
    plain
}

fn filename_from_url(url: &Url) -> Option<String> {
    let segment = url.path_segments()?.filter(|s| !s.is_empty()).last()?;
    let decoded = urlencoding::decode(segment).ok()?;
    non_empty(sanitize_filename(&decoded))
}

fn non_empty(name: String) -> Option<String> {
    if name.is_empty() { None } else { Some(name) }
}

/// Replaces characters that are not allowed in file names.
fn sanitize_filename(filename: &str) -> String {
    filename
        .trim()
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            _ => c,
        })
        .collect()
}

fn parse_cookie_header(header: &str, domain: &str) -> Vec<Cookie> {
    header
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            Some(Cookie {
                name: name.to_string(),
                value: value.to_string(),
                domain: domain.to_string(),
            })
        })
        .collect()
}
