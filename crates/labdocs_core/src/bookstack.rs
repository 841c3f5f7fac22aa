use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::{Method, StatusCode};
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, AUTHORIZATION, USER_AGENT};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::config::ApiCredentials;

pub const DEFAULT_USER_AGENT: &str = "labdocs/0.2";
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const LIST_PAGE_SIZE: usize = 500;
const ERROR_BODY_LIMIT: usize = 500;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Book {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub slug: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Chapter {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub book_id: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Page {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub book_id: i64,
    /// Zero when the page sits directly in a book.
    #[serde(default)]
    pub chapter_id: i64,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Chapter,
    Page,
    #[serde(other)]
    Other,
}

/// One entry of a book's `contents` array.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct BookContent {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ContentKind,
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub book_id: i64,
}

impl BookContent {
    pub fn into_chapter(self, book_id: i64) -> Chapter {
        Chapter {
            id: self.id,
            name: self.name,
            slug: self.slug,
            book_id: if self.book_id == 0 { book_id } else { self.book_id },
        }
    }
}

/// Names match case-insensitively; the first match in server order wins.
pub fn names_match(left: &str, right: &str) -> bool {
    left.to_lowercase() == right.to_lowercase()
}

pub trait BookStackApi {
    fn list_books(&mut self) -> Result<Vec<Book>>;
    fn create_book(&mut self, name: &str, description: &str) -> Result<Book>;
    /// Book contents: chapters and loose pages, discriminated by `kind`.
    fn list_chapters(&mut self, book_id: i64) -> Result<Vec<BookContent>>;
    fn create_chapter(&mut self, book_id: i64, name: &str, description: &str) -> Result<Chapter>;
    fn list_pages(&mut self, chapter_id: Option<i64>) -> Result<Vec<Page>>;
    fn create_page(&mut self, chapter_id: i64, name: &str, markdown: &str) -> Result<Page>;
    fn update_page(&mut self, page_id: i64, name: &str, markdown: &str) -> Result<Page>;
    fn request_count(&self) -> usize;

    fn find_book(&mut self, name: &str) -> Result<Option<Book>> {
        Ok(self
            .list_books()?
            .into_iter()
            .find(|book| names_match(&book.name, name)))
    }

    fn find_chapter(&mut self, book_id: i64, name: &str) -> Result<Option<Chapter>> {
        Ok(self
            .list_chapters(book_id)?
            .into_iter()
            .find(|entry| entry.kind == ContentKind::Chapter && names_match(&entry.name, name))
            .map(|entry| entry.into_chapter(book_id)))
    }

    fn find_or_create_book(&mut self, name: &str) -> Result<Book> {
        if let Some(book) = self.find_book(name)? {
            info!("Found existing book: {} (ID: {})", name, book.id);
            return Ok(book);
        }
        info!("Creating new book: {name}");
        self.create_book(name, "")
    }

    fn find_or_create_chapter(&mut self, book_id: i64, name: &str) -> Result<Chapter> {
        if let Some(chapter) = self.find_chapter(book_id, name)? {
            info!("Found existing chapter: {} (ID: {})", name, chapter.id);
            return Ok(chapter);
        }
        info!("Creating new chapter: {name}");
        self.create_chapter(book_id, name, "")
    }
}

#[derive(Debug, Clone)]
pub struct BookStackClientConfig {
    pub base_url: String,
    pub credentials: ApiCredentials,
    pub user_agent: String,
    pub timeout_ms: u64,
}

impl BookStackClientConfig {
    pub fn new(base_url: &str, credentials: ApiCredentials) -> Self {
        Self {
            base_url: base_url.to_string(),
            credentials,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

pub struct BookStackClient {
    client: Client,
    base_url: String,
    authorization: String,
    user_agent: String,
    request_count: usize,
}

impl BookStackClient {
    pub fn new(config: BookStackClientConfig) -> Result<Self> {
        let base_url = config.base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            bail!("BookStack URL is not configured");
        }
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("failed to build BookStack HTTP client")?;

        Ok(Self {
            client,
            base_url,
            authorization: format!(
                "Token {}:{}",
                config.credentials.token_id, config.credentials.token_secret
            ),
            user_agent: config.user_agent,
            request_count: 0,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn request<T: DeserializeOwned>(
        &mut self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<T> {
        let url = self.endpoint(path);
        self.request_count += 1;
        debug!(%method, %url, "BookStack API request");

        let mut request = self
            .client
            .request(method.clone(), &url)
            .header(AUTHORIZATION, &self.authorization)
            .header(USER_AGENT, &self.user_agent)
            .header(ACCEPT, "application/json");
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .with_context(|| format!("failed to call BookStack API {method} {path}"))?;
        let status = response.status();
        let text = response
            .text()
            .with_context(|| format!("failed to read BookStack API response for {method} {path}"))?;
        decode_response(&method, path, status, &text)
    }

    fn list_all<T: DeserializeOwned>(&mut self, path: &str) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut offset = 0usize;
        loop {
            let page: ListResponse<T> = self.request(
                Method::GET,
                path,
                &[
                    ("count", LIST_PAGE_SIZE.to_string()),
                    ("offset", offset.to_string()),
                ],
                None,
            )?;
            let fetched = page.data.len();
            items.extend(page.data);
            offset += fetched;
            if !has_more_pages(fetched, offset, page.total) {
                break;
            }
        }
        Ok(items)
    }
}

impl BookStackApi for BookStackClient {
    fn list_books(&mut self) -> Result<Vec<Book>> {
        self.list_all("books")
    }

    fn create_book(&mut self, name: &str, description: &str) -> Result<Book> {
        self.request(
            Method::POST,
            "books",
            &[],
            Some(&json!({ "name": name, "description": description })),
        )
    }

    fn list_chapters(&mut self, book_id: i64) -> Result<Vec<BookContent>> {
        let detail: BookDetail = self.request(Method::GET, &format!("books/{book_id}"), &[], None)?;
        Ok(detail.contents)
    }

    fn create_chapter(&mut self, book_id: i64, name: &str, description: &str) -> Result<Chapter> {
        self.request(
            Method::POST,
            "chapters",
            &[],
            Some(&json!({ "book_id": book_id, "name": name, "description": description })),
        )
    }

    fn list_pages(&mut self, chapter_id: Option<i64>) -> Result<Vec<Page>> {
        let pages: Vec<Page> = self.list_all("pages")?;
        Ok(filter_pages_by_chapter(pages, chapter_id))
    }

    fn create_page(&mut self, chapter_id: i64, name: &str, markdown: &str) -> Result<Page> {
        self.request(
            Method::POST,
            "pages",
            &[],
            Some(&json!({ "chapter_id": chapter_id, "name": name, "markdown": markdown })),
        )
    }

    fn update_page(&mut self, page_id: i64, name: &str, markdown: &str) -> Result<Page> {
        self.request(
            Method::PUT,
            &format!("pages/{page_id}"),
            &[],
            Some(&json!({ "name": name, "markdown": markdown })),
        )
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

pub fn filter_pages_by_chapter(pages: Vec<Page>, chapter_id: Option<i64>) -> Vec<Page> {
    match chapter_id {
        Some(chapter_id) => pages
            .into_iter()
            .filter(|page| page.chapter_id == chapter_id)
            .collect(),
        None => pages,
    }
}

fn decode_response<T: DeserializeOwned>(
    method: &Method,
    path: &str,
    status: StatusCode,
    text: &str,
) -> Result<T> {
    if !status.is_success() {
        bail!(
            "BookStack API {method} {path} failed with HTTP {status}: {}",
            truncate(text, ERROR_BODY_LIMIT)
        );
    }
    if text.trim().is_empty() {
        bail!("BookStack API {method} {path} returned an empty body");
    }
    serde_json::from_str(text)
        .with_context(|| format!("failed to decode BookStack API response for {method} {path}"))
}

// Without `total` there is no way to know more exists; an empty page also ends
// the walk so a server that miscounts cannot loop forever.
fn has_more_pages(fetched: usize, offset: usize, total: Option<usize>) -> bool {
    match total {
        Some(total) => fetched > 0 && offset < total,
        None => false,
    }
}

fn truncate(text: &str, limit: usize) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(limit) {
        Some((index, _)) => format!("{}...", &trimmed[..index]),
        None => trimmed.to_string(),
    }
}

#[derive(Debug, Deserialize)]
struct ListResponse<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
    total: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct BookDetail {
    #[serde(default)]
    contents: Vec<BookContent>,
}
