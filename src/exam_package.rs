//! Exam packages: zip archives holding an `imsmanifest.xml`, the exam's
//! scripts, and optionally its `source.exam`.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum PackageError {
    #[error("exam package is not a readable zip archive: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("could not unpack exam package: {0}")]
    Io(#[from] std::io::Error),
    #[error("imsmanifest.xml not found")]
    MissingManifest,
    #[error("failed to parse manifest")]
    Parse,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedManifest {
    pub title: Option<String>,
    pub launch_href: String,
}

/// Unpacks `bytes` under `out_dir`. Entries that would land outside it are skipped.
pub fn extract_zip_to_dir(bytes: &[u8], out_dir: &Path) -> Result<(), PackageError> {
    fs::create_dir_all(out_dir)?;
    let mut zip = zip::ZipArchive::new(std::io::Cursor::new(bytes))?;
    for i in 0..zip.len() {
        let mut file = zip.by_index(i)?;
        let Some(rel) = file.enclosed_name().map(Path::to_path_buf) else {
            tracing::warn!(entry = file.name(), "skipping zip entry outside package root");
            continue;
        };
        let outpath = out_dir.join(rel);
        if file.is_dir() {
            fs::create_dir_all(&outpath)?;
            continue;
        }
        if let Some(parent) = outpath.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut outfile = fs::File::create(&outpath)?;
        std::io::copy(&mut file, &mut outfile)?;
    }
    Ok(())
}

pub fn find_manifest(dir: &Path) -> Result<PathBuf, PackageError> {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .find(|e| e.file_name() == "imsmanifest.xml")
        .map(|e| e.path().to_path_buf())
        .ok_or(PackageError::MissingManifest)
}

/// Reads the title of the default organization and the href of its first item.
pub fn parse_manifest(xml: &str) -> Result<ParsedManifest, PackageError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);
    let mut buf = Vec::new();

    let mut resources: HashMap<String, String> = HashMap::new();
    let mut default_org: Option<String> = None;
    let mut current_org: Option<String> = None;
    let mut item_depth = 0usize;
    let mut in_title = false;
    let mut org_titles: HashMap<String, String> = HashMap::new();
    // (organization, identifierref) in document order
    let mut item_refs: Vec<(Option<String>, String)> = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match local_name(&e).as_str() {
                "organizations" => default_org = get_attr(&e, "default"),
                "organization" => current_org = get_attr(&e, "identifier"),
                "item" => {
                    item_depth += 1;
                    if let Some(iref) = get_attr(&e, "identifierref") {
                        item_refs.push((current_org.clone(), iref));
                    }
                }
                "title" => in_title = item_depth == 0 && current_org.is_some(),
                "resource" => record_resource(&e, &mut resources),
                _ => {}
            },
            Ok(Event::Empty(e)) => match local_name(&e).as_str() {
                "item" => {
                    if let Some(iref) = get_attr(&e, "identifierref") {
                        item_refs.push((current_org.clone(), iref));
                    }
                }
                "resource" => record_resource(&e, &mut resources),
                _ => {}
            },
            Ok(Event::Text(t)) if in_title => {
                if let (Some(org), Ok(text)) = (&current_org, t.unescape()) {
                    org_titles.entry(org.clone()).or_insert_with(|| text.into_owned());
                }
            }
            Ok(Event::End(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                match name.rsplit(':').next().unwrap_or(&name) {
                    "organization" => current_org = None,
                    "item" => item_depth = item_depth.saturating_sub(1),
                    "title" => in_title = false,
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => return Err(PackageError::Parse),
            _ => {}
        }
        buf.clear();
    }

    let in_default = |org: &Option<String>| match (&default_org, org) {
        (Some(def), Some(cur)) => def == cur,
        (None, Some(_)) => true,
        _ => false,
    };
    let launch_href = item_refs
        .iter()
        .filter(|(org, _)| in_default(org))
        .chain(item_refs.iter())
        .find_map(|(_, iref)| resources.get(iref).cloned())
        .or_else(|| {
            let mut hrefs: Vec<&String> = resources.values().collect();
            hrefs.sort();
            hrefs.first().map(|h| h.to_string())
        })
        .ok_or(PackageError::Parse)?;

    let title = default_org
        .as_ref()
        .and_then(|org| org_titles.get(org).cloned())
        .or_else(|| org_titles.values().next().cloned());

    Ok(ParsedManifest { title, launch_href })
}

/// Extracts a package under `out_dir` and reads its manifest. On failure
/// nothing is left behind in `out_dir`.
pub fn unpack(bytes: &[u8], out_dir: &Path) -> Result<(PathBuf, ParsedManifest), PackageError> {
    let unpacked = extract_zip_to_dir(bytes, out_dir).and_then(|()| {
        let manifest_path = find_manifest(out_dir)?;
        let manifest = parse_manifest(&fs::read_to_string(&manifest_path)?)?;
        Ok((manifest_path, manifest))
    });
    if unpacked.is_err() {
        if let Err(e) = fs::remove_dir_all(out_dir) {
            tracing::warn!(dir = %out_dir.display(), error = %e, "could not remove rejected package");
        }
    }
    unpacked
}

/// The exam definition shipped in the package, if any. The file's first
/// line is a header; the JSON document follows it.
pub fn read_exam_source(package_dir: &Path) -> Option<serde_json::Value> {
    let text = fs::read_to_string(package_dir.join("source.exam")).ok()?;
    let body = text.split_once('\n').map_or("", |(_, rest)| rest);
    serde_json::from_str(body).ok()
}

fn record_resource(e: &BytesStart<'_>, resources: &mut HashMap<String, String>) {
    if let (Some(id), Some(href)) = (get_attr(e, "identifier"), get_attr(e, "href")) {
        resources.insert(id, href);
    }
}

fn local_name(tag: &BytesStart<'_>) -> String {
    let full = String::from_utf8_lossy(tag.name().as_ref()).to_string();
    full.rsplit(':').next().unwrap_or(&full).to_string()
}

fn get_attr(e: &BytesStart<'_>, key_local: &str) -> Option<String> {
    for a in e.attributes().flatten() {
        let key = std::str::from_utf8(a.key.as_ref()).unwrap_or_default();
        let key = key.rsplit(':').next().unwrap_or(key);
        if key == key_local {
            return Some(a.unescape_value().ok()?.into_owned());
        }
    }
    None
}
