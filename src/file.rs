//! File and directory serving.
//!
//! Maps a context to a directory on disk, with conditional and partial
//! retrieval per the RFC, content types inferred from file suffixes, and
//! optional generated directory index pages.

use std::fs::{self, File, Metadata};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use chrono::{DateTime, Utc};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};

use crate::cond::conditional_status;
use crate::date::format_date;
use crate::host::{ContextHandler, Outcome};
use crate::mime::content_type_for;
use crate::request::Request;
use crate::response::Response;
use crate::util::{parent_path, size_approx};
use crate::Result;

/// A handler serving a context from a directory on disk (recursively).
pub struct FileContextHandler {
    base: PathBuf,
}

impl FileContextHandler {
    /// Creates a handler serving files from the given directory.
    pub fn new(dir: &Path) -> Result<Self> {
        Ok(FileContextHandler {
            base: fs::canonicalize(dir)?,
        })
    }
}

impl ContextHandler for FileContextHandler {
    fn serve(&self, req: &mut Request<'_>, resp: &mut Response<'_>) -> Result<Outcome> {
        let context = req.context().path().to_string();
        serve_file(&self.base, &context, req, resp)
    }
}

/// Serves a context's contents from a file-based resource.
///
/// The file is located by stripping the context prefix from the request
/// path and resolving the result against the base directory. Missing,
/// hidden and dot files yield 404; unreadable files and paths escaping the
/// base directory yield 403. Directories are served as a welcome redirect
/// or a generated index page, according to the virtual host.
pub fn serve_file(
    base: &Path,
    context: &str,
    req: &mut Request<'_>,
    resp: &mut Response<'_>,
) -> Result<Outcome> {
    let relative = req.path().get(context.len()..).unwrap_or("").to_string();
    let target = base.join(relative.trim_start_matches('/'));
    let file = match fs::canonicalize(&target) {
        Ok(file) => file,
        Err(_) => return Ok(Outcome::Status(404)),
    };
    let hidden = file
        .file_name()
        .map_or(false, |n| n.to_string_lossy().starts_with('.'));
    if hidden {
        return Ok(Outcome::Status(404));
    }
    if !file.starts_with(base) {
        // directory traversal guard
        return Ok(Outcome::Status(403));
    }
    let meta = match fs::metadata(&file) {
        Ok(meta) => meta,
        Err(_) => return Ok(Outcome::Status(403)),
    };
    if meta.is_dir() {
        if relative.ends_with('/') {
            if !req.virtual_host().allows_generated_index() {
                return Ok(Outcome::Status(403));
            }
            let index = create_index(&file, req.path())?;
            resp.send(200, &index)?;
        } else {
            // redirect to the normalized directory URL ending with '/'
            let base_url = req.base_url().map(|u| u.to_string()).unwrap_or_default();
            let location = format!("{}{}/", base_url, req.path());
            resp.redirect(&location, true)?;
        }
    } else if relative.ends_with('/') {
        // non-directory path ending with a slash
        return Ok(Outcome::Status(404));
    } else {
        match File::open(&file) {
            Ok(f) => serve_file_content(f, &meta, &file, req, resp)?,
            Err(_) => return Ok(Outcome::Status(403)),
        }
    }
    Ok(Outcome::Handled)
}

/// Serves the contents of an opened file with its content type, validators,
/// and conditional/partial retrieval handling.
pub fn serve_file_content(
    mut file: File,
    meta: &Metadata,
    path: &Path,
    req: &mut Request<'_>,
    resp: &mut Response<'_>,
) -> Result<()> {
    let len = meta.len();
    let modified = modified_time(meta);
    // a weak tag based on the modification date
    let etag = format!("W/\"{}\"", modified.timestamp());
    let mut status = 200;
    let mut range = req.range(len);
    if range.is_none() || len == 0 {
        range = None;
        status = conditional_status(req, modified, &etag);
    } else {
        let if_range = req.headers().get("If-Range").map(|v| v.to_string());
        let start_valid = range.map_or(false, |(start, _)| start < len);
        match if_range {
            None => {
                if !start_valid {
                    status = 416; // unsatisfiable range
                } else {
                    status = conditional_status(req, modified, &etag);
                }
            }
            Some(if_range) => {
                if !start_valid {
                    // RFC 2616 sections 14.16, 10.4.17: an invalid If-Range
                    // range gets everything
                    range = None;
                } else if !if_range.starts_with('"') && !if_range.starts_with("W/") {
                    if let Some(date) = req.headers().get_date("If-Range") {
                        if modified > date {
                            range = None; // modified - send everything
                        }
                    }
                } else if if_range != etag {
                    range = None; // modified - send everything
                }
            }
        }
    }
    match status {
        304 => {
            // no other headers or body allowed
            resp.headers_mut().add("ETag", &etag);
            resp.headers_mut().add("Vary", "Accept-Encoding");
            resp.headers_mut().add("Last-Modified", &format_date(modified));
            resp.send_headers(304)?;
        }
        412 => {
            resp.send_headers(412)?;
        }
        416 => {
            resp.headers_mut()
                .add("Content-Range", &format!("bytes */{}", len));
            resp.send_headers(416)?;
        }
        200 => {
            let name = path.file_name().map(|n| n.to_string_lossy().into_owned());
            let content_type =
                content_type_for(name.as_deref().unwrap_or(""), "application/octet-stream");
            resp.send_headers_full(
                200,
                Some(len),
                Some(modified),
                Some(&etag),
                Some(&content_type),
                range,
            )?;
            resp.send_body(&mut file, Some(len), range)?;
        }
        _ => {
            resp.send_headers(500)?; // should never happen
        }
    }
    Ok(())
}

fn modified_time(meta: &Metadata) -> DateTime<Utc> {
    // truncated to whole seconds, the precision of the date headers
    let seconds = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    DateTime::from_timestamp(seconds, 0).unwrap_or_default()
}

// characters that must be encoded inside a generated link
const LINK_SET: &AsciiSet = &CONTROLS.add(b' ').add(b'"').add(b'<').add(b'>').add(b'`');

/// Renders the contents of a directory as an HTML index page, in the
/// familiar Apache format.
pub fn create_index(dir: &Path, path: &str) -> Result<String> {
    let mut shown = path.to_string();
    if !shown.ends_with('/') {
        shown.push('/');
    }
    let mut entries: Vec<fs::DirEntry> = fs::read_dir(dir)?.filter_map(|e| e.ok()).collect();
    entries.sort_by_key(|e| e.file_name());
    // calculate the name column width
    let mut width = 21usize;
    for entry in &entries {
        width = width.max(entry.file_name().to_string_lossy().chars().count());
    }
    width += 2; // room for the added slash and space

    let mut html = String::new();
    html.push_str(&format!(
        "<!DOCTYPE html>\n<html><head><title>Index of {0}</title></head>\n\
         <body><h1>Index of {0}</h1>\n<pre> Name{1:>2$} Last modified      Size<hr>",
        shown,
        "",
        width - 5
    ));
    if shown.len() > 1 {
        // add a parent link if this is not the root path
        let parent = parent_path(&shown).unwrap_or("");
        html.push_str(&format!(
            " <a href=\"{0}/\">Parent Directory</a>{1:>2$}-\n",
            parent,
            "",
            width + 5
        ));
    }
    for entry in &entries {
        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(_) => continue,
        };
        let mut name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        if meta.is_dir() {
            name.push('/');
        }
        let size = if meta.is_dir() {
            "- ".to_string()
        } else {
            size_approx(meta.len())
        };
        let link = utf8_percent_encode(&format!("{}{}", shown, name), LINK_SET).to_string();
        let modified = modified_time(&meta).format("%d-%b-%Y %H:%M").to_string();
        let pad = width - name.chars().count();
        html.push_str(&format!(
            " <a href=\"{0}\">{1}</a>{2:3$}&#8206;{4}{5:>6}\n",
            link, name, "", pad, modified, size
        ));
    }
    html.push_str("</pre></body></html>");
    Ok(html)
}
