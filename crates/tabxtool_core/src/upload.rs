use std::env;
use std::fs;
use std::path::Path;
use std::thread::sleep;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use reqwest::Url;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::config::ToolConfig;
use crate::output::{ChunkFile, discover_chunk_files};

/// Header carrying the site API key on wikis that require one.
const AUTH_KEY_HEADER: &str = "X-authkey";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingPage {
    pub page_id: i64,
    pub title: String,
}

/// The slice of the MediaWiki API the uploader needs.
pub trait TabxWikiApi {
    fn login(&mut self, username: &str, password: &str) -> Result<()>;
    fn edit_page(&mut self, title: &str, content: &str, summary: &str) -> Result<()>;
    /// Return the subset of `titles` that exist on the wiki.
    fn existing_pages(&mut self, titles: &[String]) -> Result<Vec<ExistingPage>>;
    fn delete_page(&mut self, page: &ExistingPage, reason: &str) -> Result<()>;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct MediaWikiClientConfig {
    pub api_url: String,
    pub user_agent: String,
    pub auth_key: Option<String>,
    pub timeout_ms: u64,
    pub rate_limit_read_ms: u64,
    pub rate_limit_write_ms: u64,
}

impl MediaWikiClientConfig {
    pub fn from_config(config: &ToolConfig) -> Result<Self> {
        let Some(api_url) = config.api_url_owned() else {
            bail!("wiki API URL is not configured (set WIKI_API_URL or [wiki].api_url)");
        };
        Ok(Self {
            api_url,
            user_agent: config.user_agent(),
            auth_key: env::var("WIKI_API_AUTH_KEY")
                .ok()
                .filter(|value| !value.trim().is_empty()),
            timeout_ms: env_value_u64("WIKI_HTTP_TIMEOUT_MS", 120_000),
            rate_limit_read_ms: env_value_u64("WIKI_RATE_LIMIT_READ", 300),
            rate_limit_write_ms: env_value_u64("WIKI_RATE_LIMIT_WRITE", 1_000),
        })
    }
}

pub struct MediaWikiClient {
    client: Client,
    config: MediaWikiClientConfig,
    last_request_at: Option<Instant>,
    request_count: usize,
    csrf_token: Option<String>,
}

impl MediaWikiClient {
    pub fn new(config: MediaWikiClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .cookie_store(true)
            .build()
            .context("failed to build MediaWiki HTTP client")?;

        Ok(Self {
            client,
            config,
            last_request_at: None,
            request_count: 0,
            csrf_token: None,
        })
    }

    fn request_json_get(&mut self, params: &[(&str, String)]) -> Result<Value> {
        let base_url = Url::parse(&self.config.api_url)
            .with_context(|| format!("invalid WIKI_API_URL: {}", self.config.api_url))?;
        let pairs = api_pairs(params);

        self.apply_rate_limit(false);
        let mut request = self
            .client
            .get(base_url)
            .header("User-Agent", self.config.user_agent.clone())
            .query(&pairs);
        if let Some(key) = &self.config.auth_key {
            request = request.header(AUTH_KEY_HEADER, key.clone());
        }
        let response = request.send().context("failed to call MediaWiki API")?;
        decode_api_response(response)
    }

    fn request_json_post(&mut self, params: &[(&str, String)], is_write: bool) -> Result<Value> {
        let pairs = api_pairs(params);

        self.apply_rate_limit(is_write);
        let mut request = self
            .client
            .post(&self.config.api_url)
            .header("User-Agent", self.config.user_agent.clone())
            .form(&pairs);
        if let Some(key) = &self.config.auth_key {
            request = request.header(AUTH_KEY_HEADER, key.clone());
        }
        let response = request.send().context("failed to call MediaWiki API")?;
        decode_api_response(response)
    }

    fn apply_rate_limit(&mut self, is_write: bool) {
        let delay = if is_write {
            Duration::from_millis(self.config.rate_limit_write_ms)
        } else {
            Duration::from_millis(self.config.rate_limit_read_ms)
        };
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
    }

    fn ensure_csrf_token(&mut self) -> Result<String> {
        if let Some(token) = &self.csrf_token {
            return Ok(token.clone());
        }
        let response = self.request_json_get(&[
            ("action", "query".to_string()),
            ("meta", "tokens".to_string()),
        ])?;
        let parsed: TokenQueryResponse =
            serde_json::from_value(response).context("failed to decode csrf token response")?;
        let token = parsed
            .query
            .tokens
            .and_then(|tokens| tokens.csrftoken)
            .ok_or_else(|| anyhow::anyhow!("failed to get MediaWiki csrf token"))?;
        self.csrf_token = Some(token.clone());
        Ok(token)
    }
}

impl TabxWikiApi for MediaWikiClient {
    fn login(&mut self, username: &str, password: &str) -> Result<()> {
        let token_response = self.request_json_get(&[
            ("action", "query".to_string()),
            ("meta", "tokens".to_string()),
            ("type", "login".to_string()),
        ])?;
        let token_payload: TokenQueryResponse = serde_json::from_value(token_response)
            .context("failed to decode login token response")?;
        let login_token = token_payload
            .query
            .tokens
            .and_then(|tokens| tokens.logintoken)
            .ok_or_else(|| anyhow::anyhow!("failed to get MediaWiki login token"))?;

        let login_response = self.request_json_post(
            &[
                ("action", "login".to_string()),
                ("lgname", username.to_string()),
                ("lgpassword", password.to_string()),
                ("lgtoken", login_token),
            ],
            true,
        )?;
        let login_payload: LoginResponse =
            serde_json::from_value(login_response).context("failed to decode login response")?;
        match login_payload.login.result.as_deref() {
            Some("Success") => {
                self.csrf_token = None;
                Ok(())
            }
            other => bail!(
                "MediaWiki login failed: {}",
                login_payload
                    .login
                    .reason
                    .or_else(|| other.map(ToString::to_string))
                    .unwrap_or_else(|| "unknown error".to_string())
            ),
        }
    }

    fn edit_page(&mut self, title: &str, content: &str, summary: &str) -> Result<()> {
        let token = self.ensure_csrf_token()?;
        let response = self.request_json_post(
            &[
                ("action", "edit".to_string()),
                ("title", title.to_string()),
                ("text", content.to_string()),
                ("summary", summary.to_string()),
                ("bot", "1".to_string()),
                ("token", token),
            ],
            true,
        )?;
        let edit_payload: EditResponse =
            serde_json::from_value(response).context("failed to decode edit response")?;
        let result = edit_payload.edit.and_then(|edit| edit.result);
        if result.as_deref() != Some("Success") {
            bail!(
                "MediaWiki edit failed for {}: {}",
                title,
                result.unwrap_or_else(|| "unknown".to_string())
            );
        }
        Ok(())
    }

    fn existing_pages(&mut self, titles: &[String]) -> Result<Vec<ExistingPage>> {
        let mut output = Vec::new();
        for batch in titles.chunks(50) {
            let response = self.request_json_get(&[
                ("action", "query".to_string()),
                ("prop", "info".to_string()),
                ("titles", batch.join("|")),
            ])?;
            let parsed: PageInfoResponse = serde_json::from_value(response)
                .context("failed to decode page info response")?;
            for page in parsed.query.pages {
                if page.missing.unwrap_or(false) {
                    continue;
                }
                let Some(page_id) = page.pageid.filter(|id| *id > 0) else {
                    continue;
                };
                output.push(ExistingPage {
                    page_id,
                    title: page.title,
                });
            }
        }
        Ok(output)
    }

    fn delete_page(&mut self, page: &ExistingPage, reason: &str) -> Result<()> {
        let token = self.ensure_csrf_token()?;
        let response = self.request_json_post(
            &[
                ("action", "delete".to_string()),
                ("pageid", page.page_id.to_string()),
                ("reason", reason.to_string()),
                ("token", token),
            ],
            true,
        );

        match response {
            Ok(_) => Ok(()),
            Err(error) => {
                if error.to_string().contains("missingtitle") {
                    return Ok(());
                }
                Err(error)
            }
        }
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn from_env() -> Result<Self> {
        let username = env::var("WIKI_USERNAME").unwrap_or_default();
        let password = env::var("WIKI_PASSWORD").unwrap_or_default();
        if username.trim().is_empty() || password.is_empty() {
            bail!("set WIKI_USERNAME and WIKI_PASSWORD to upload (or use --dry-run)");
        }
        Ok(Self {
            username: username.trim().to_string(),
            password,
        })
    }
}

#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub prefix: String,
    pub namespace: String,
    pub summary: String,
    pub limit_bytes: usize,
    pub max_remote_chunks: usize,
}

impl UploadOptions {
    pub fn page_title(&self, file: &ChunkFile) -> String {
        format!("{}:{}.tabx", self.namespace, file.stem())
    }

    fn chunk_page_title(&self, index: usize) -> String {
        format!("{}:{}_chunk_{index}.tabx", self.namespace, self.prefix)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SizeCheck {
    pub file_name: String,
    pub bytes: u64,
    pub exceeds: bool,
}

/// Sizes of the local chunk files against the page limit. Touches no network.
pub fn dry_run(output_dir: &Path, options: &UploadOptions) -> Result<Vec<SizeCheck>> {
    let mut checks = Vec::new();
    for file in discover_chunk_files(output_dir, &options.prefix)? {
        let bytes = fs::metadata(&file.path)
            .with_context(|| format!("failed to inspect {}", file.path.display()))?
            .len();
        checks.push(SizeCheck {
            exceeds: bytes > options.limit_bytes as u64,
            file_name: file.file_name,
            bytes,
        });
    }
    Ok(checks)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadAction {
    Upload,
    Delete,
}

impl UploadAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadTask {
    pub action: UploadAction,
    pub title: String,
    pub bytes: Option<usize>,
    pub elapsed_ms: f64,
    pub error: Option<String>,
}

impl UploadTask {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UploadReport {
    pub tasks: Vec<UploadTask>,
    pub stale_query_error: Option<String>,
    pub request_count: usize,
}

impl UploadReport {
    pub fn uploaded(&self) -> usize {
        self.count(UploadAction::Upload, true)
    }

    pub fn failed(&self) -> usize {
        self.tasks.iter().filter(|task| !task.succeeded()).count()
    }

    pub fn deleted(&self) -> usize {
        self.count(UploadAction::Delete, true)
    }

    fn count(&self, action: UploadAction, succeeded: bool) -> usize {
        self.tasks
            .iter()
            .filter(|task| task.action == action && task.succeeded() == succeeded)
            .count()
    }
}

pub fn upload_chunks(
    output_dir: &Path,
    options: &UploadOptions,
    config: &ToolConfig,
    credentials: &Credentials,
) -> Result<UploadReport> {
    let files = discover_chunk_files(output_dir, &options.prefix)?;
    let mut client = MediaWikiClient::new(MediaWikiClientConfig::from_config(config)?)?;
    info!(user = %credentials.username, "logging in to wiki");
    client.login(&credentials.username, &credentials.password)?;
    upload_chunks_with_api(&files, options, &mut client)
}

/// Upload chunk pages in index order, then delete remote chunk pages beyond
/// the last local index. A failed page is recorded and the run continues.
pub fn upload_chunks_with_api<A: TabxWikiApi>(
    files: &[ChunkFile],
    options: &UploadOptions,
    api: &mut A,
) -> Result<UploadReport> {
    let mut report = UploadReport::default();

    for file in files {
        let content = fs::read_to_string(&file.path)
            .with_context(|| format!("failed to read {}", file.path.display()))?;
        let title = options.page_title(file);
        if content.len() > options.limit_bytes {
            warn!(title = %title, bytes = content.len(), limit = options.limit_bytes, "chunk exceeds the page limit");
        }
        let started = Instant::now();
        let result = api.edit_page(&title, &content, &options.summary);
        report.tasks.push(UploadTask {
            action: UploadAction::Upload,
            title,
            bytes: Some(content.len()),
            elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
            error: result.err().map(|error| format!("{error:#}")),
        });
    }

    let first_stale = files.last().map_or(0, |file| file.index + 1);
    let stale_titles = (first_stale..options.max_remote_chunks)
        .map(|index| options.chunk_page_title(index))
        .collect::<Vec<_>>();
    if !stale_titles.is_empty() {
        match api.existing_pages(&stale_titles) {
            Ok(pages) => {
                for page in pages {
                    let started = Instant::now();
                    let result = api.delete_page(&page, &options.summary);
                    report.tasks.push(UploadTask {
                        action: UploadAction::Delete,
                        title: page.title,
                        bytes: None,
                        elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
                        error: result.err().map(|error| format!("{error:#}")),
                    });
                }
            }
            Err(error) => {
                warn!(error = %format!("{error:#}"), "failed to query stale chunk pages");
                report.stale_query_error = Some(format!("{error:#}"));
            }
        }
    }

    report.request_count = api.request_count();
    Ok(report)
}

fn api_pairs(params: &[(&str, String)]) -> Vec<(String, String)> {
    let mut pairs = Vec::with_capacity(params.len() + 2);
    pairs.push(("format".to_string(), "json".to_string()));
    pairs.push(("formatversion".to_string(), "2".to_string()));
    for (key, value) in params {
        if !value.is_empty() {
            pairs.push(((*key).to_string(), value.clone()));
        }
    }
    pairs
}

fn decode_api_response(response: reqwest::blocking::Response) -> Result<Value> {
    let status = response.status();
    if !status.is_success() {
        bail!("MediaWiki API request failed with HTTP {status}");
    }
    let payload: Value = response
        .json()
        .context("failed to decode MediaWiki API JSON response")?;
    if let Some(error) = payload.get("error") {
        let code = error
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or("unknown_error");
        let info = error
            .get("info")
            .and_then(Value::as_str)
            .unwrap_or("unknown info");
        bail!("MediaWiki API error [{code}]: {info}");
    }
    Ok(payload)
}

fn env_value_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

#[derive(Debug, Deserialize, Default)]
struct TokenQueryResponse {
    #[serde(default)]
    query: TokenQueryPayload,
}

#[derive(Debug, Deserialize, Default)]
struct TokenQueryPayload {
    tokens: Option<TokenPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct TokenPayload {
    logintoken: Option<String>,
    csrftoken: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct LoginResponse {
    #[serde(default)]
    login: LoginPayload,
}

#[derive(Debug, Deserialize, Default)]
struct LoginPayload {
    result: Option<String>,
    reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct EditResponse {
    edit: Option<EditPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct EditPayload {
    result: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct PageInfoResponse {
    #[serde(default)]
    query: PageInfoPayload,
}

#[derive(Debug, Deserialize, Default)]
struct PageInfoPayload {
    #[serde(default)]
    pages: Vec<PageInfoItem>,
}

#[derive(Debug, Deserialize)]
struct PageInfoItem {
    pageid: Option<i64>,
    title: String,
    missing: Option<bool>,
}
