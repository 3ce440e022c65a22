//! DOCX content extraction: paragraphs, relationships and image references.
//!
//! A DOCX file is a ZIP archive. Three parts matter here:
//!
//! - `word/document.xml`: the body (paragraphs, runs, embedded pictures)
//! - `word/_rels/document.xml.rels`: relationship id → target (e.g. `rId7` → `media/image3.wmf`)
//! - `word/media/*`: the picture bytes, including MathType formulas stored as WMF/EMF
//!
//! The markup is scanned with regular expressions rather than parsed into a
//! tree. Exam documents produced by Word and MathType are flat enough that
//! paragraph and run boundaries are reliable anchors, and a regex scan never
//! rejects a document because of one malformed element; non-matching regions
//! are skipped. Everything regex-shaped stays private to this module, so the
//! scanner can be replaced by a real XML reader without touching callers.

use crate::error::ExamError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use zip::ZipArchive;

const DOCUMENT_ENTRY: &str = "word/document.xml";
const RELS_ENTRY: &str = "word/_rels/document.xml.rels";
const MEDIA_PREFIX: &str = "word/media/";

// ── Data model ───────────────────────────────────────────────────────────

/// One entry of `document.xml.rels`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relationship {
    /// Full relationship type URI.
    pub rel_type: String,
    /// Target path relative to `word/` (e.g. `media/image1.png`).
    pub target: String,
}

impl Relationship {
    pub fn is_image(&self) -> bool {
        self.rel_type.ends_with("/image")
    }

    /// Last path segment of the target.
    pub fn file_name(&self) -> &str {
        self.target.rsplit('/').next().unwrap_or(&self.target)
    }
}

/// Relationship id → relationship, fixed once the document is parsed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelationshipMap(HashMap<String, Relationship>);

impl RelationshipMap {
    /// Parse the relationships part. Elements missing `Id` or `Target` are skipped.
    pub fn parse(xml: &str) -> Self {
        let map = RE_RELATIONSHIP
            .captures_iter(xml)
            .filter_map(|caps| {
                let attrs = parse_attributes(&caps[1]);
                let id = attrs.get("Id")?.clone();
                let target = attrs.get("Target")?.clone();
                let rel_type = attrs.get("Type").cloned().unwrap_or_default();
                Some((id, Relationship { rel_type, target }))
            })
            .collect();
        RelationshipMap(map)
    }

    pub fn get(&self, id: &str) -> Option<&Relationship> {
        self.0.get(id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A picture referenced from the body, in order of first appearance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Relationship id (`rId…`).
    pub id: String,
    /// Media file name, e.g. `image12.wmf`.
    pub filename: String,
    /// Zero-based order of first appearance.
    pub position: usize,
}

impl ImageReference {
    /// Stable label used in the prompt: `img_1`, `img_2`, …
    pub fn label(&self) -> String {
        format!("img_{}", self.position + 1)
    }

    /// WMF/EMF pictures are treated as formula objects (MathType, Equation 3.0).
    pub fn is_formula(&self) -> bool {
        is_formula_asset(&self.filename)
    }
}

/// True for vector formats the renderer must rasterise before OCR.
pub fn is_formula_asset(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.ends_with(".wmf") || lower.ends_with(".emf")
}

/// Everything recovered from one document.
#[derive(Debug, Clone, Default)]
pub struct DocxContent {
    /// Non-empty paragraphs joined with newlines.
    pub full_text: String,
    /// Paragraph texts in document order, with `[img_N]` markers for pictures.
    pub paragraphs: Vec<String>,
    pub relationships: RelationshipMap,
    pub images: Vec<ImageReference>,
}

impl DocxContent {
    /// References whose media is a WMF/EMF formula.
    pub fn formula_images(&self) -> impl Iterator<Item = &ImageReference> {
        self.images.iter().filter(|i| i.is_formula())
    }
}

// ── Patterns ─────────────────────────────────────────────────────────────

static RE_RELATIONSHIP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<Relationship\b([^>]*?)/?>").unwrap());

static RE_ATTRIBUTE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([A-Za-z_:][\w:.-]*)\s*=\s*"([^"]*)""#).unwrap());

static RE_PARAGRAPH: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<w:p[\s>].*?</w:p>").unwrap());

/// Tokens inside a paragraph, in the order they must be emitted.
static RE_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r#"<w:t(?:\s[^>]*)?>(?P<text>[^<]*)</w:t>"#,
        r#"|(?P<tab><w:tab/>)"#,
        r#"|(?P<br><w:br(?:\s[^>]*)?/>)"#,
        r#"|r:embed="(?P<embed>[^"]+)""#,
        r#"|<v:imagedata\b[^>]*?\br:id="(?P<vml>[^"]+)""#,
    ))
    .unwrap()
});

static RE_ENTITY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"&(?:#(\d+)|#x([0-9A-Fa-f]+)|(lt|gt|amp|quot|apos));").unwrap());

fn parse_attributes(raw: &str) -> HashMap<String, String> {
    RE_ATTRIBUTE
        .captures_iter(raw)
        .map(|c| (c[1].to_string(), unescape_xml(&c[2])))
        .collect()
}

fn unescape_xml(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    RE_ENTITY
        .replace_all(s, |caps: &regex::Captures<'_>| {
            let decoded = if let Some(dec) = caps.get(1) {
                dec.as_str().parse::<u32>().ok().and_then(char::from_u32)
            } else if let Some(hex) = caps.get(2) {
                u32::from_str_radix(hex.as_str(), 16)
                    .ok()
                    .and_then(char::from_u32)
            } else {
                match &caps[3] {
                    "lt" => Some('<'),
                    "gt" => Some('>'),
                    "amp" => Some('&'),
                    "quot" => Some('"'),
                    _ => Some('\''),
                }
            };
            decoded
                .map(String::from)
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

// ── Body scan ────────────────────────────────────────────────────────────

/// Scan `document.xml` into paragraph texts and ordered image references.
///
/// Image ids that do not resolve to an image relationship are dropped. A
/// relationship used several times produces one reference and the same
/// `[img_N]` marker at every use.
pub fn parse_document_xml(
    xml: &str,
    relationships: &RelationshipMap,
) -> (Vec<String>, Vec<ImageReference>) {
    let mut paragraphs = Vec::new();
    let mut images: Vec<ImageReference> = Vec::new();
    let mut by_id: HashMap<String, usize> = HashMap::new();

    for para in RE_PARAGRAPH.find_iter(xml) {
        let mut text = String::new();

        for caps in RE_TOKEN.captures_iter(para.as_str()) {
            if let Some(t) = caps.name("text") {
                text.push_str(&unescape_xml(t.as_str()));
            } else if caps.name("tab").is_some() {
                text.push('\t');
            } else if caps.name("br").is_some() {
                text.push('\n');
            } else if let Some(id) = caps.name("embed").or_else(|| caps.name("vml")) {
                let id = id.as_str();
                let Some(rel) = relationships.get(id).filter(|r| r.is_image()) else {
                    debug!("Dropping unresolvable image reference {}", id);
                    continue;
                };
                let position = *by_id.entry(id.to_string()).or_insert_with(|| {
                    images.push(ImageReference {
                        id: id.to_string(),
                        filename: rel.file_name().to_string(),
                        position: images.len(),
                    });
                    images.len() - 1
                });
                if !text.is_empty() && !text.ends_with(' ') {
                    text.push(' ');
                }
                text.push_str(&format!("[{}] ", images[position].label()));
            }
        }

        let text = text.trim();
        if !text.is_empty() {
            paragraphs.push(text.to_string());
        }
    }

    (paragraphs, images)
}

// ── Archive access ───────────────────────────────────────────────────────

fn open_archive(path: &Path) -> Result<ZipArchive<File>, ExamError> {
    let file = File::open(path).map_err(|e| ExamError::io(path, e))?;
    ZipArchive::new(file).map_err(|e| ExamError::InvalidArchive {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })
}

fn read_entry_string(
    archive: &mut ZipArchive<File>,
    path: &Path,
    entry: &str,
) -> Result<Option<String>, ExamError> {
    let Ok(mut file) = archive.by_name(entry) else {
        return Ok(None);
    };
    let mut bytes = Vec::with_capacity(file.size() as usize);
    file.read_to_end(&mut bytes)
        .map_err(|e| ExamError::io(path.join(entry), e))?;
    Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
}

/// Parse a DOCX into text, relationships and image references.
///
/// Archive reads are blocking, so the work runs on the blocking pool.
pub async fn extract_content(path: &Path) -> Result<DocxContent, ExamError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || extract_content_blocking(&path))
        .await
        .map_err(|e| ExamError::Internal(format!("Extract task panicked: {}", e)))?
}

fn extract_content_blocking(path: &Path) -> Result<DocxContent, ExamError> {
    let mut archive = open_archive(path)?;

    let document_xml = read_entry_string(&mut archive, path, DOCUMENT_ENTRY)?.ok_or_else(|| {
        ExamError::MissingDocumentEntry {
            path: path.to_path_buf(),
            entry: DOCUMENT_ENTRY.to_string(),
        }
    })?;

    let relationships = read_entry_string(&mut archive, path, RELS_ENTRY)?
        .map(|xml| RelationshipMap::parse(&xml))
        .unwrap_or_default();

    let (paragraphs, images) = parse_document_xml(&document_xml, &relationships);
    let full_text = paragraphs.join("\n");

    info!(
        "Parsed {}: {} paragraphs, {} relationships, {} images",
        path.display(),
        paragraphs.len(),
        relationships.len(),
        images.len()
    );

    Ok(DocxContent {
        full_text,
        paragraphs,
        relationships,
        images,
    })
}

/// Write every `word/media/*` entry into `target_dir`, returning the written paths.
///
/// Files are named after the entry's last path segment; a second call into
/// the same directory overwrites same-named files.
pub async fn extract_images(path: &Path, target_dir: &Path) -> Result<Vec<PathBuf>, ExamError> {
    let path = path.to_path_buf();
    let target = target_dir.to_path_buf();
    tokio::task::spawn_blocking(move || extract_images_blocking(&path, &target))
        .await
        .map_err(|e| ExamError::Internal(format!("Image extraction task panicked: {}", e)))?
}

fn extract_images_blocking(path: &Path, target_dir: &Path) -> Result<Vec<PathBuf>, ExamError> {
    let mut archive = open_archive(path)?;
    std::fs::create_dir_all(target_dir).map_err(|e| ExamError::io(target_dir, e))?;

    let mut written = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| ExamError::InvalidArchive {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        let name = entry.name().to_string();
        if entry.is_dir() || !name.starts_with(MEDIA_PREFIX) {
            continue;
        }
        let Some(file_name) = name.rsplit('/').next().filter(|n| !n.is_empty()) else {
            continue;
        };

        let out = target_dir.join(file_name);
        let mut bytes = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut bytes)
            .map_err(|e| ExamError::io(path.join(&name), e))?;
        std::fs::write(&out, &bytes).map_err(|e| ExamError::io(&out, e))?;
        written.push(out);
    }

    info!("Extracted {} media files to {}", written.len(), target_dir.display());
    Ok(written)
}

/// Read the raw bytes of the named media files (names without the `word/media/` prefix).
///
/// Names absent from the archive are left out of the result.
pub fn read_media(path: &Path, names: &[String]) -> Result<HashMap<String, Vec<u8>>, ExamError> {
    let mut archive = open_archive(path)?;
    let mut found = HashMap::with_capacity(names.len());

    for name in names {
        if found.contains_key(name) {
            continue;
        }
        let entry_name = format!("{MEDIA_PREFIX}{name}");
        let Ok(mut entry) = archive.by_name(&entry_name) else {
            debug!("Media entry {} not in archive", entry_name);
            continue;
        };
        let mut bytes = Vec::with_capacity(entry.size() as usize);
        if entry.read_to_end(&mut bytes).is_ok() {
            found.insert(name.clone(), bytes);
        }
    }

    Ok(found)
}
