use std::fmt;

use anyhow::Result;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::bookstack::{BookStackApi, Chapter, names_match};
use crate::config::{BookEntry, ChapterConfig, PageConfig};
use crate::context::DocsContext;
use crate::render::TemplateRenderer;

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    /// Log intended writes without performing them.
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct SyncStats {
    pub created: usize,
    pub updated: usize,
    pub errors: usize,
}

impl SyncStats {
    pub fn is_success(&self) -> bool {
        self.errors == 0
    }
}

impl fmt::Display for SyncStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "created={} updated={} errors={}",
            self.created, self.updated, self.errors
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageAction {
    Created,
    Updated,
    WouldCreate,
    WouldUpdate,
}

/// Bring the remote book/chapter/page tree in line with `books`.
///
/// Errors are isolated per page and per chapter: each one is logged, counted,
/// and processing moves on to the next sibling. A book lookup failure skips
/// that book only.
pub fn update_docs<A: BookStackApi>(
    api: &mut A,
    books: &[BookEntry],
    renderer: &TemplateRenderer,
    context: &DocsContext,
    options: &SyncOptions,
) -> SyncStats {
    let mut stats = SyncStats::default();
    for entry in books {
        if let Err(error) = sync_book(api, entry, renderer, context, options, &mut stats) {
            error!("Error with book {}: {error:#}", entry.book.name);
            stats.errors += 1;
        }
    }
    info!(
        requests = api.request_count(),
        dry_run = options.dry_run,
        "reconciliation finished: {stats}"
    );
    stats
}

fn sync_book<A: BookStackApi>(
    api: &mut A,
    entry: &BookEntry,
    renderer: &TemplateRenderer,
    context: &DocsContext,
    options: &SyncOptions,
    stats: &mut SyncStats,
) -> Result<()> {
    let book_name = &entry.book.name;
    let book_id = if options.dry_run {
        match api.find_book(book_name)? {
            Some(book) => Some(book.id),
            None => {
                info!("Would create book: {book_name}");
                None
            }
        }
    } else {
        Some(api.find_or_create_book(book_name)?.id)
    };

    for chapter_config in &entry.book.chapters {
        if let Err(error) =
            sync_chapter(api, book_id, chapter_config, renderer, context, options, stats)
        {
            error!("Error with chapter {}: {error:#}", chapter_config.name);
            stats.errors += 1;
        }
    }
    Ok(())
}

fn sync_chapter<A: BookStackApi>(
    api: &mut A,
    book_id: Option<i64>,
    chapter_config: &ChapterConfig,
    renderer: &TemplateRenderer,
    context: &DocsContext,
    options: &SyncOptions,
    stats: &mut SyncStats,
) -> Result<()> {
    let chapter = resolve_chapter(api, book_id, &chapter_config.name, options)?;
    let chapter_id = chapter.as_ref().map(|chapter| chapter.id);

    for page_config in &chapter_config.pages {
        let Some(template) = page_config.template.as_deref() else {
            continue;
        };
        match sync_page(api, chapter_id, page_config, template, renderer, context, options) {
            Ok(PageAction::Created) => {
                info!("Created page: {}", page_config.name);
                stats.created += 1;
            }
            Ok(PageAction::Updated) => {
                info!("Updated page: {}", page_config.name);
                stats.updated += 1;
            }
            Ok(PageAction::WouldCreate) => info!("Would create page: {}", page_config.name),
            Ok(PageAction::WouldUpdate) => info!("Would update page: {}", page_config.name),
            Err(error) => {
                error!("Error with page {}: {error:#}", page_config.name);
                stats.errors += 1;
            }
        }
    }
    Ok(())
}

// In dry-run mode nothing is created; a missing container resolves to `None`.
fn resolve_chapter<A: BookStackApi>(
    api: &mut A,
    book_id: Option<i64>,
    name: &str,
    options: &SyncOptions,
) -> Result<Option<Chapter>> {
    let Some(book_id) = book_id else {
        info!("Would create chapter: {name}");
        return Ok(None);
    };
    if !options.dry_run {
        return api.find_or_create_chapter(book_id, name).map(Some);
    }
    let chapter = api.find_chapter(book_id, name)?;
    if chapter.is_none() {
        info!("Would create chapter: {name}");
    }
    Ok(chapter)
}

fn sync_page<A: BookStackApi>(
    api: &mut A,
    chapter_id: Option<i64>,
    page_config: &PageConfig,
    template: &str,
    renderer: &TemplateRenderer,
    context: &DocsContext,
    options: &SyncOptions,
) -> Result<PageAction> {
    let content = renderer.render(template, context)?;

    let Some(chapter_id) = chapter_id else {
        return Ok(PageAction::WouldCreate);
    };
    let existing = api
        .list_pages(Some(chapter_id))?
        .into_iter()
        .find(|page| names_match(&page.name, &page_config.name));

    match (existing, options.dry_run) {
        (Some(_), true) => Ok(PageAction::WouldUpdate),
        (None, true) => Ok(PageAction::WouldCreate),
        (Some(page), false) => {
            api.update_page(page.id, &page_config.name, &content)?;
            Ok(PageAction::Updated)
        }
        (None, false) => {
            api.create_page(chapter_id, &page_config.name, &content)?;
            Ok(PageAction::Created)
        }
    }
}

/// Stats reported when the API cannot be used at all; `missing` names the
/// settings that are absent.
pub fn unconfigured_api_stats(missing: &[&str]) -> SyncStats {
    warn!("BookStack API not configured: missing {}", missing.join(", "));
    error!("API not configured - cannot update docs");
    SyncStats {
        created: 0,
        updated: 0,
        errors: 1,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};
    use std::fs;
    use std::path::Path;

    use anyhow::bail;
    use tempfile::tempdir;

    use super::*;
    use crate::bookstack::{Book, BookContent, ContentKind, Page};
    use crate::config::BookConfig;
    use crate::context::K3S_VERSION;

    #[derive(Default)]
    struct MockApi {
        books: Vec<Book>,
        contents: BTreeMap<i64, Vec<BookContent>>,
        pages: Vec<Page>,
        failing_books: BTreeSet<String>,
        failing_chapters: BTreeSet<String>,
        failing_pages: BTreeSet<String>,
        created_books: Vec<String>,
        created_chapters: Vec<String>,
        created_pages: Vec<(i64, String, String)>,
        updated_pages: Vec<(i64, String, String)>,
        next_id: i64,
        request_count: usize,
    }

    impl MockApi {
        fn allocate_id(&mut self) -> i64 {
            self.next_id += 1;
            1000 + self.next_id
        }

        fn write_calls(&self) -> usize {
            self.created_books.len()
                + self.created_chapters.len()
                + self.created_pages.len()
                + self.updated_pages.len()
        }
    }

    impl BookStackApi for MockApi {
        fn list_books(&mut self) -> Result<Vec<Book>> {
            self.request_count += 1;
            Ok(self.books.clone())
        }

        fn create_book(&mut self, name: &str, _description: &str) -> Result<Book> {
            self.request_count += 1;
            if self.failing_books.contains(name) {
                bail!("HTTP 500 creating book {name}");
            }
            let book = Book {
                id: self.allocate_id(),
                name: name.to_string(),
                slug: String::new(),
            };
            self.created_books.push(name.to_string());
            self.books.push(book.clone());
            Ok(book)
        }

        fn list_chapters(&mut self, book_id: i64) -> Result<Vec<BookContent>> {
            self.request_count += 1;
            Ok(self.contents.get(&book_id).cloned().unwrap_or_default())
        }

        fn create_chapter(&mut self, book_id: i64, name: &str, _description: &str) -> Result<Chapter> {
            self.request_count += 1;
            if self.failing_chapters.contains(name) {
                bail!("HTTP 422 creating chapter {name}");
            }
            let id = self.allocate_id();
            self.created_chapters.push(name.to_string());
            self.contents.entry(book_id).or_default().push(BookContent {
                id,
                name: name.to_string(),
                kind: ContentKind::Chapter,
                slug: String::new(),
                book_id,
            });
            Ok(Chapter {
                id,
                name: name.to_string(),
                slug: String::new(),
                book_id,
            })
        }

        fn list_pages(&mut self, chapter_id: Option<i64>) -> Result<Vec<Page>> {
            self.request_count += 1;
            Ok(crate::bookstack::filter_pages_by_chapter(
                self.pages.clone(),
                chapter_id,
            ))
        }

        fn create_page(&mut self, chapter_id: i64, name: &str, markdown: &str) -> Result<Page> {
            self.request_count += 1;
            if self.failing_pages.contains(name) {
                bail!("HTTP 500 creating page {name}");
            }
            let page = Page {
                id: self.allocate_id(),
                name: name.to_string(),
                slug: String::new(),
                book_id: 0,
                chapter_id,
            };
            self.created_pages
                .push((chapter_id, name.to_string(), markdown.to_string()));
            self.pages.push(page.clone());
            Ok(page)
        }

        fn update_page(&mut self, page_id: i64, name: &str, markdown: &str) -> Result<Page> {
            self.request_count += 1;
            if self.failing_pages.contains(name) {
                bail!("HTTP 500 updating page {name}");
            }
            self.updated_pages
                .push((page_id, name.to_string(), markdown.to_string()));
            let page = self
                .pages
                .iter()
                .find(|page| page.id == page_id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("page {page_id} not found"))?;
            Ok(page)
        }

        fn request_count(&self) -> usize {
            self.request_count
        }
    }

    fn context() -> DocsContext {
        DocsContext {
            updated_at: "2026-01-01 00:00:00".to_string(),
            nodes: Vec::new(),
            vms: Vec::new(),
            vms_by_node: BTreeMap::new(),
            k3s_version: K3S_VERSION.to_string(),
            k3s_nodes: Vec::new(),
            namespaces: Vec::new(),
            deployments: Vec::new(),
            services: Vec::new(),
            ingresses: Vec::new(),
        }
    }

    fn renderer(dir: &Path) -> TemplateRenderer {
        fs::write(dir.join("overview.md.j2"), "Overview {{ updated_at }}").expect("write template");
        fs::write(dir.join("vms.md.j2"), "VMs on {{ k3s_version }}").expect("write template");
        TemplateRenderer::new(dir)
    }

    fn page(name: &str, template: Option<&str>) -> PageConfig {
        PageConfig {
            name: name.to_string(),
            template: template.map(ToString::to_string),
        }
    }

    fn books(chapters: Vec<ChapterConfig>) -> Vec<BookEntry> {
        vec![BookEntry {
            key: "infrastructure".to_string(),
            book: BookConfig {
                name: "Infrastructure".to_string(),
                description: String::new(),
                chapters,
            },
        }]
    }

    fn chapter(name: &str, pages: Vec<PageConfig>) -> ChapterConfig {
        ChapterConfig {
            name: name.to_string(),
            description: String::new(),
            pages,
        }
    }

    fn existing_tree() -> MockApi {
        MockApi {
            books: vec![Book {
                id: 1,
                name: "infrastructure".to_string(),
                slug: "infrastructure".to_string(),
            }],
            contents: BTreeMap::from([(
                1,
                vec![BookContent {
                    id: 10,
                    name: "Proxmox Nodes".to_string(),
                    kind: ContentKind::Chapter,
                    slug: String::new(),
                    book_id: 1,
                }],
            )]),
            pages: vec![Page {
                id: 100,
                name: "OVERVIEW".to_string(),
                slug: String::new(),
                book_id: 1,
                chapter_id: 10,
            }],
            ..MockApi::default()
        }
    }

    #[test]
    fn creates_missing_and_updates_existing_pages() {
        let temp = tempdir().expect("tempdir");
        let renderer = renderer(temp.path());
        let mut api = existing_tree();
        let books = books(vec![chapter(
            "proxmox nodes",
            vec![
                page("Overview", Some("templates/overview.md.j2")),
                page("VM Inventory", Some("vms.md.j2")),
            ],
        )]);

        let stats = update_docs(&mut api, &books, &renderer, &context(), &SyncOptions::default());
        assert_eq!(
            stats,
            SyncStats {
                created: 1,
                updated: 1,
                errors: 0
            }
        );
        assert!(api.created_books.is_empty());
        assert!(api.created_chapters.is_empty());
        assert_eq!(
            api.updated_pages,
            vec![(
                100,
                "Overview".to_string(),
                "Overview 2026-01-01 00:00:00".to_string()
            )]
        );
        assert_eq!(
            api.created_pages,
            vec![(
                10,
                "VM Inventory".to_string(),
                format!("VMs on {K3S_VERSION}")
            )]
        );
    }

    #[test]
    fn builds_missing_book_and_chapter() {
        let temp = tempdir().expect("tempdir");
        let renderer = renderer(temp.path());
        let mut api = MockApi::default();
        let books = books(vec![chapter(
            "Virtual Machines",
            vec![page("VM Inventory", Some("vms.md.j2"))],
        )]);

        let stats = update_docs(&mut api, &books, &renderer, &context(), &SyncOptions::default());
        assert_eq!(stats.created, 1);
        assert_eq!(api.created_books, vec!["Infrastructure".to_string()]);
        assert_eq!(api.created_chapters, vec!["Virtual Machines".to_string()]);
    }

    #[test]
    fn dry_run_never_writes() {
        let temp = tempdir().expect("tempdir");
        let renderer = renderer(temp.path());
        let options = SyncOptions { dry_run: true };

        let mut existing = existing_tree();
        let tree = books(vec![
            chapter(
                "Proxmox Nodes",
                vec![
                    page("Overview", Some("overview.md.j2")),
                    page("New Page", Some("vms.md.j2")),
                ],
            ),
            chapter("Storage", vec![page("Pools", Some("vms.md.j2"))]),
        ]);
        let stats = update_docs(&mut existing, &tree, &renderer, &context(), &options);
        assert_eq!(stats, SyncStats::default());
        assert_eq!(existing.write_calls(), 0);

        let mut empty = MockApi::default();
        let stats = update_docs(&mut empty, &tree, &renderer, &context(), &options);
        assert_eq!(stats, SyncStats::default());
        assert_eq!(empty.write_calls(), 0);
    }

    #[test]
    fn render_failure_counts_and_continues() {
        let temp = tempdir().expect("tempdir");
        let renderer = renderer(temp.path());
        let mut api = existing_tree();
        let books = books(vec![chapter(
            "Proxmox Nodes",
            vec![
                page("Broken", Some("missing.md.j2")),
                page("Overview", Some("overview.md.j2")),
                page("Notes", None),
            ],
        )]);

        let stats = update_docs(&mut api, &books, &renderer, &context(), &SyncOptions::default());
        assert_eq!(
            stats,
            SyncStats {
                created: 0,
                updated: 1,
                errors: 1
            }
        );
        assert!(api.created_pages.is_empty());
    }

    #[test]
    fn write_failure_is_isolated_to_the_page() {
        let temp = tempdir().expect("tempdir");
        let renderer = renderer(temp.path());
        let mut api = existing_tree();
        api.failing_pages.insert("First".to_string());
        let books = books(vec![chapter(
            "Proxmox Nodes",
            vec![
                page("First", Some("vms.md.j2")),
                page("Second", Some("vms.md.j2")),
            ],
        )]);

        let stats = update_docs(&mut api, &books, &renderer, &context(), &SyncOptions::default());
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.created, 1);
        assert_eq!(api.created_pages[0].1, "Second");
    }

    #[test]
    fn chapter_failure_skips_only_that_chapter() {
        let temp = tempdir().expect("tempdir");
        let renderer = renderer(temp.path());
        let mut api = existing_tree();
        api.failing_chapters.insert("Broken Chapter".to_string());
        let books = books(vec![
            chapter("Broken Chapter", vec![page("A", Some("vms.md.j2"))]),
            chapter("Proxmox Nodes", vec![page("B", Some("vms.md.j2"))]),
        ]);

        let stats = update_docs(&mut api, &books, &renderer, &context(), &SyncOptions::default());
        assert_eq!(
            stats,
            SyncStats {
                created: 1,
                updated: 0,
                errors: 1
            }
        );
    }

    #[test]
    fn book_failure_moves_to_next_book() {
        let temp = tempdir().expect("tempdir");
        let renderer = renderer(temp.path());
        let mut api = MockApi::default();
        api.failing_books.insert("Runbooks".to_string());
        let mut tree = books(vec![chapter("Nodes", vec![page("A", Some("vms.md.j2"))])]);
        tree.insert(
            0,
            BookEntry {
                key: "runbooks".to_string(),
                book: BookConfig {
                    name: "Runbooks".to_string(),
                    description: String::new(),
                    chapters: vec![chapter("Maintenance", vec![page("B", Some("vms.md.j2"))])],
                },
            },
        );

        let stats = update_docs(&mut api, &tree, &renderer, &context(), &SyncOptions::default());
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.created, 1);
        assert_eq!(api.created_books, vec!["Infrastructure".to_string()]);
    }

    #[test]
    fn stats_display_and_success() {
        let stats = SyncStats {
            created: 2,
            updated: 3,
            errors: 0,
        };
        assert!(stats.is_success());
        assert_eq!(stats.to_string(), "created=2 updated=3 errors=0");
        assert!(!unconfigured_api_stats(&["bookstack.url"]).is_success());
    }
}
