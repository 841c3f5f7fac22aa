use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use regex::Regex;
use reqwest::blocking::{Client, Response};
use reqwest::header::LOCATION;
use reqwest::redirect::Policy;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::config::{BookEntry, patch_bookstack_tokens};

pub const DEFAULT_ADMIN_EMAIL: &str = "admin@admin.com";
pub const DEFAULT_ADMIN_PASSWORD: &str = "password";
pub const DEFAULT_TOKEN_NAME: &str = "Homelab-Automation";
pub const DEFAULT_CREDENTIALS_FILENAME: &str = "bookstack-credentials.yaml";
/// Used when the chapter form and the book page both lack a numeric book id.
const FALLBACK_BOOK_ID: &str = "1";
const MAX_REDIRECTS: usize = 10;
const SESSION_TIMEOUT_MS: u64 = 30_000;

static CSRF_FIELD_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"name="_token"\s+value="([^"]+)""#).expect("invalid csrf field regex")
});
static CSRF_META_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<meta name="token" content="([^"]+)""#).expect("invalid csrf meta regex")
});
static BOOK_ID_FIELD_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"name="book_id"\s+value="(\d+)""#).expect("invalid book id regex")
});
static BOOK_ID_LINK_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/books/(\d+)").expect("invalid book link regex"));
static TOKEN_ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)Token ID.*?<code[^>]*>([^<]+)</code>").expect("invalid token id regex")
});
static TOKEN_SECRET_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)Token Secret.*?<code[^>]*>([^<]+)</code>")
        .expect("invalid token secret regex")
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreatedBook {
    pub name: String,
    pub slug: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreatedChapter {
    pub book_slug: String,
    pub name: String,
    pub slug: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiToken {
    pub id: String,
    pub secret: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialsFile {
    pub bookstack: StoredCredentials,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCredentials {
    pub url: String,
    pub admin_email: String,
    pub admin_password: String,
    pub api_token_id: String,
    pub api_token_secret: String,
}

#[derive(Debug, Clone)]
pub struct BootstrapOptions {
    pub url: String,
    pub email: String,
    pub password: String,
    pub token_name: String,
    pub credentials_path: PathBuf,
    /// Config file whose token fields are rewritten; `None` leaves it untouched.
    pub config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BootstrapReport {
    pub books: Vec<CreatedBook>,
    pub chapters: Vec<CreatedChapter>,
    pub failures: usize,
    pub token: Option<ApiToken>,
    pub config_patched: bool,
}

struct FetchedPage {
    url: Url,
    status: StatusCode,
    body: String,
}

pub struct BootstrapSession {
    client: Client,
    base_url: Url,
}

impl BootstrapSession {
    pub fn new(base_url: &str) -> Result<Self> {
        let trimmed = base_url.trim().trim_end_matches('/');
        let base_url = Url::parse(&format!("{trimmed}/"))
            .with_context(|| format!("invalid BookStack URL: {base_url}"))?;
        let client = Client::builder()
            .timeout(Duration::from_millis(SESSION_TIMEOUT_MS))
            .cookie_store(true)
            .redirect(Policy::none())
            .build()
            .context("failed to build BookStack session client")?;
        Ok(Self { client, base_url })
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .with_context(|| format!("invalid BookStack path: {path}"))
    }

    /// Log in through the HTML form. Success is inferred from a redirect followed
    /// by a home page that shows a logout link or the account email.
    pub fn login(&self, email: &str, password: &str) -> Result<bool> {
        let login_url = self.url("/login")?;
        let page = self.get(login_url.clone())?;
        if !page.status.is_success() {
            bail!("login page returned HTTP {}", page.status);
        }
        let token = extract_csrf_token(&page.body)
            .ok_or_else(|| anyhow::anyhow!("could not find CSRF token on login page"))?;

        let response = self
            .client
            .post(login_url)
            .form(&[
                ("_token", token.as_str()),
                ("email", email),
                ("password", password),
            ])
            .send()
            .context("failed to submit login form")?;
        let mut status = response.status();

        if is_form_redirect(status) {
            let home = self.get(self.url("/")?)?;
            status = home.status;
            if home.body.to_lowercase().contains("logout") || home.body.contains(email) {
                println!("Logged in as {email}");
                return Ok(true);
            }
        }

        println!("Login failed - status: {}", status.as_u16());
        Ok(false)
    }

    pub fn create_book(&self, name: &str, description: &str) -> Result<Option<CreatedBook>> {
        let token = self.page_token("/create-book")?;
        let response = self
            .client
            .post(self.url("/books")?)
            .form(&[("_token", token.as_str()), ("name", name), ("description", description)])
            .send()
            .with_context(|| format!("failed to submit book form for {name}"))?;
        let status = response.status();

        if is_form_redirect(status) {
            let slug = location_header(&response)
                .map(|location| slug_from_location(&location))
                .unwrap_or_default();
            if !slug.is_empty() {
                println!("Created book: {name} (slug: {slug})");
                return Ok(Some(CreatedBook {
                    name: name.to_string(),
                    slug,
                }));
            }
        }

        println!("Failed to create book '{name}' - status: {}", status.as_u16());
        Ok(None)
    }

    pub fn create_chapter(
        &self,
        book_slug: &str,
        name: &str,
        description: &str,
    ) -> Result<Option<CreatedChapter>> {
        let create_url = self.url(&format!("/books/{book_slug}/create-chapter"))?;
        let page = self.get(create_url.clone())?;
        if page.status != StatusCode::OK {
            println!("  Cannot access chapter creation page for {book_slug}");
            return Ok(None);
        }
        let Some(token) = extract_csrf_token(&page.body) else {
            println!("  Could not find CSRF token on chapter page for {book_slug}");
            return Ok(None);
        };

        let book_id = match extract_book_id_field(&page.body) {
            Some(book_id) => book_id,
            None => {
                let book_page = self.get(self.url(&format!("/books/{book_slug}"))?)?;
                extract_book_id_from_links(&book_page.body).unwrap_or_else(|| {
                    debug!(book_slug, "falling back to default book id");
                    FALLBACK_BOOK_ID.to_string()
                })
            }
        };

        let response = self
            .client
            .post(create_url)
            .form(&[
                ("_token", token.as_str()),
                ("name", name),
                ("description_html", description),
                ("description", description),
                ("book_id", book_id.as_str()),
            ])
            .send()
            .with_context(|| format!("failed to submit chapter form for {name}"))?;
        let landed = self.follow(response)?;

        if landed.status == StatusCode::OK && landed.body.contains(name) {
            println!("  Created chapter: {name}");
            return Ok(Some(CreatedChapter {
                book_slug: book_slug.to_string(),
                name: name.to_string(),
                slug: chapter_slug_from_name(name),
            }));
        }
        if landed.url.as_str().contains("/chapter/") {
            let slug = slug_from_location(landed.url.as_str());
            println!("  Created chapter: {name} (slug: {slug})");
            return Ok(Some(CreatedChapter {
                book_slug: book_slug.to_string(),
                name: name.to_string(),
                slug,
            }));
        }

        println!(
            "  Failed to create chapter '{name}' - status: {}",
            landed.status.as_u16()
        );
        Ok(None)
    }

    /// Create an API token and scrape its id and secret from the page shown
    /// after creation.
    pub fn create_api_token(&self, name: &str) -> Result<Option<ApiToken>> {
        let tokens_url = self.url("/api-tokens")?;
        let page = self.get(tokens_url.clone())?;
        if page.status != StatusCode::OK {
            println!("API tokens page not accessible");
            return Ok(None);
        }
        let Some(token) = extract_csrf_token(&page.body) else {
            println!("Could not find CSRF token on API tokens page");
            return Ok(None);
        };

        let response = self
            .client
            .post(tokens_url.clone())
            .form(&[("_token", token.as_str()), ("name", name), ("expires_at", "")])
            .send()
            .context("failed to submit API token form")?;
        let status = response.status();

        if is_form_redirect(status)
            && let Some(location) = location_header(&response)
            && location.contains("/api-tokens/")
        {
            let target = tokens_url
                .join(&location)
                .with_context(|| format!("invalid redirect location: {location}"))?;
            let created = self.get(target)?;
            if let Some(api_token) = extract_api_token(&created.body) {
                return Ok(Some(api_token));
            }
        }

        println!("Failed to create API token - status: {}", status.as_u16());
        Ok(None)
    }

    fn page_token(&self, path: &str) -> Result<String> {
        let page = self.get(self.url(path)?)?;
        if !page.status.is_success() {
            bail!("{path} returned HTTP {}", page.status);
        }
        extract_csrf_token(&page.body)
            .ok_or_else(|| anyhow::anyhow!("could not find CSRF token on {path}"))
    }

    fn get(&self, url: Url) -> Result<FetchedPage> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .with_context(|| format!("failed to GET {url}"))?;
        self.follow(response)
    }

    // Redirects are followed by hand so form posts can inspect the first hop.
    fn follow(&self, mut response: Response) -> Result<FetchedPage> {
        for _ in 0..MAX_REDIRECTS {
            if !response.status().is_redirection() {
                break;
            }
            let Some(location) = location_header(&response) else {
                break;
            };
            let next = response
                .url()
                .join(&location)
                .with_context(|| format!("invalid redirect location: {location}"))?;
            response = self
                .client
                .get(next.clone())
                .send()
                .with_context(|| format!("failed to GET {next}"))?;
        }
        let url = response.url().clone();
        let status = response.status();
        let body = response
            .text()
            .with_context(|| format!("failed to read response body from {url}"))?;
        Ok(FetchedPage { url, status, body })
    }
}

/// Log in, create the declared books and chapters, mint an API token, then
/// persist the credentials. A failure on one book or chapter does not stop the
/// rest.
pub fn run_bootstrap(options: &BootstrapOptions, books: &[BookEntry]) -> Result<BootstrapReport> {
    println!("Connecting to BookStack at {}...", options.url);
    let session = BootstrapSession::new(&options.url)?;
    if !session.login(&options.email, &options.password)? {
        bail!("Failed to login to BookStack");
    }

    let mut report = BootstrapReport::default();
    println!("\nCreating book structure...");
    for entry in books {
        let book = match session.create_book(&entry.book.name, &entry.book.description) {
            Ok(Some(book)) => book,
            Ok(None) => {
                report.failures += 1;
                continue;
            }
            Err(err) => {
                error!("book {}: {err:#}", entry.book.name);
                println!("Failed to create book '{}': {err:#}", entry.book.name);
                report.failures += 1;
                continue;
            }
        };
        for chapter in &entry.book.chapters {
            match session.create_chapter(&book.slug, &chapter.name, &chapter.description) {
                Ok(Some(created)) => report.chapters.push(created),
                Ok(None) => report.failures += 1,
                Err(err) => {
                    error!("chapter {}: {err:#}", chapter.name);
                    println!("  Failed to create chapter '{}': {err:#}", chapter.name);
                    report.failures += 1;
                }
            }
        }
        report.books.push(book);
    }

    println!("\nCreating API token for automation...");
    report.token = match session.create_api_token(&options.token_name) {
        Ok(token) => token,
        Err(err) => {
            error!("api token: {err:#}");
            println!("Failed to create API token: {err:#}");
            None
        }
    };

    if let Some(token) = &report.token {
        println!("\nAPI Token Created:");
        println!("  Token ID: {}", token.id);
        println!("  Token Secret: {}", token.secret);
        if let Some(config_path) = &options.config_path
            && patch_bookstack_tokens(config_path, &token.id, &token.secret)?
        {
            println!("\nUpdated {} with API credentials", config_path.display());
            report.config_patched = true;
        }
    }

    let credentials = CredentialsFile {
        bookstack: StoredCredentials {
            url: options.url.clone(),
            admin_email: options.email.clone(),
            admin_password: options.password.clone(),
            api_token_id: report
                .token
                .as_ref()
                .map(|token| token.id.clone())
                .unwrap_or_default(),
            api_token_secret: report
                .token
                .as_ref()
                .map(|token| token.secret.clone())
                .unwrap_or_default(),
        },
    };
    write_credentials_file(&options.credentials_path, &credentials)?;
    println!("Saved credentials to {}", options.credentials_path.display());

    println!("\n{}", "=".repeat(50));
    println!("BookStack initialization complete!");
    println!("Access BookStack at: {}", options.url);
    println!("Login: {}", options.email);
    println!("{}", "=".repeat(50));

    Ok(report)
}

/// Write the credentials YAML readable and writable by the owner only.
pub fn write_credentials_file(path: &Path, credentials: &CredentialsFile) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let rendered =
        serde_yaml::to_string(credentials).context("failed to serialize credentials YAML")?;

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    // `mode` only applies on creation; tighten a pre-existing file before writing.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))
            .with_context(|| format!("failed to restrict permissions on {}", path.display()))?;
    }
    file.write_all(rendered.as_bytes())
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

pub fn extract_csrf_token(html: &str) -> Option<String> {
    CSRF_FIELD_PATTERN
        .captures(html)
        .or_else(|| CSRF_META_PATTERN.captures(html))
        .map(|captures| captures[1].to_string())
}

pub fn extract_book_id_field(html: &str) -> Option<String> {
    BOOK_ID_FIELD_PATTERN
        .captures(html)
        .map(|captures| captures[1].to_string())
}

pub fn extract_book_id_from_links(html: &str) -> Option<String> {
    BOOK_ID_LINK_PATTERN
        .captures(html)
        .map(|captures| captures[1].to_string())
}

pub fn extract_api_token(html: &str) -> Option<ApiToken> {
    let id = TOKEN_ID_PATTERN.captures(html)?[1].trim().to_string();
    let secret = TOKEN_SECRET_PATTERN.captures(html)?[1].trim().to_string();
    Some(ApiToken { id, secret })
}

/// Last path segment of a redirect target.
pub fn slug_from_location(location: &str) -> String {
    location
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

pub fn chapter_slug_from_name(name: &str) -> String {
    name.to_lowercase().replace(' ', "-")
}

fn is_form_redirect(status: StatusCode) -> bool {
    matches!(status, StatusCode::FOUND | StatusCode::SEE_OTHER)
}

fn location_header(response: &Response) -> Option<String> {
    response
        .headers()
        .get(LOCATION)
        .and_then(|value| value.to_str().ok())
        .map(ToString::to_string)
}
