//! iTunes-style XML library maintenance
//!
//! A single library file is shared by every exported playlist. Each export
//! loads it, merges tracks (by file location) and playlists (by server guid,
//! falling back to name), and rewrites it in a fixed layout so an unchanged
//! merge leaves the file byte-for-byte identical.

use base64::{Engine as _, engine::general_purpose};
use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};
use url::Url;

use super::LocalTrackRecord;

/// File name of the shared library
pub const LIBRARY_FILE: &str = "iTunes Music Library.xml";

const DOCTYPE: &str = r#"<!DOCTYPE plist PUBLIC "-//Apple Computer//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">"#;

const HEADER_ORDER: [&str; 5] = [
    "Major Version",
    "Minor Version",
    "Application Version",
    "Music Folder",
    "Library Persistent ID",
];

const TRACK_ORDER: [&str; 8] = [
    "Name",
    "Artist",
    "Album",
    "Total Time",
    "Track Type",
    "Persistent ID",
    "Date Added",
    "Location",
];

const PLAYLIST_ORDER: [&str; 4] = ["Name", "Playlist ID", "Playlist Persistent ID", "All Items"];

/// Property list value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Integer(i64),
    Real(f64),
    String(String),
    Bool(bool),
    Date(DateTime<Utc>),
    Data(Vec<u8>),
    Array(Vec<Value>),
    Dict(Fields),
}

impl Value {
    fn from_plist(value: &plist::Value) -> Option<Self> {
        match value {
            plist::Value::Integer(i) => i.as_signed().map(Value::Integer),
            plist::Value::Real(r) => Some(Value::Real(*r)),
            plist::Value::String(s) => Some(Value::String(s.clone())),
            plist::Value::Boolean(b) => Some(Value::Bool(*b)),
            plist::Value::Date(d) => {
                let time: SystemTime = d.clone().into();
                Some(Value::Date(DateTime::<Utc>::from(time)))
            }
            plist::Value::Data(bytes) => Some(Value::Data(bytes.clone())),
            plist::Value::Array(items) => Some(Value::Array(
                items.iter().filter_map(Value::from_plist).collect(),
            )),
            plist::Value::Dictionary(dict) => Some(Value::Dict(fields_from_plist(dict))),
            other => {
                warn!("Dropping unsupported library value {:?}", other);
                None
            }
        }
    }

    fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

type Fields = BTreeMap<String, Value>;

fn fields_from_plist(dict: &plist::Dictionary) -> Fields {
    dict.iter()
        .filter_map(|(k, v)| Value::from_plist(v).map(|v| (k.clone(), v)))
        .collect()
}

/// A playlist inside the library document
#[derive(Debug, Clone, PartialEq)]
pub struct PlaylistEntry {
    fields: Fields,
    items: Vec<u64>,
}

impl PlaylistEntry {
    pub fn name(&self) -> Option<&str> {
        self.fields.get("Name").and_then(Value::as_str)
    }

    pub fn items(&self) -> &[u64] {
        &self.items
    }

    pub fn persistent_id(&self) -> Option<&str> {
        self.fields.get("Playlist Persistent ID").and_then(Value::as_str)
    }
}

/// In-memory form of the library document
#[derive(Debug, Clone, PartialEq)]
pub struct ItunesLibrary {
    header: Fields,
    tracks: BTreeMap<u64, Fields>,
    playlists: Vec<PlaylistEntry>,
    next_track_id: u64,
}

impl ItunesLibrary {
    /// Create an empty library rooted at `music_folder`
    pub fn new(music_folder: &Path) -> Self {
        let mut header = Fields::new();
        header.insert("Major Version".to_string(), Value::Integer(1));
        header.insert("Minor Version".to_string(), Value::Integer(1));
        header.insert(
            "Application Version".to_string(),
            Value::String("plexmix".to_string()),
        );
        header.insert(
            "Music Folder".to_string(),
            Value::String(file_url(music_folder)),
        );
        header.insert(
            "Library Persistent ID".to_string(),
            Value::String(persistent_id(&format!("library:{}", music_folder.display()))),
        );

        Self {
            header,
            tracks: BTreeMap::new(),
            playlists: Vec::new(),
            next_track_id: 1,
        }
    }

    /// Load the library at `path`, or start a new one
    ///
    /// A file that cannot be parsed is replaced by an empty library; its
    /// content will be lost on the next save, which is logged. Errors reading
    /// an existing file are returned.
    pub fn load_or_create(path: &Path, music_folder: &Path) -> io::Result<Self> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No library at {}, creating a new one", path.display());
                return Ok(Self::new(music_folder));
            }
            Err(e) => return Err(e),
        };

        match Self::parse(&bytes) {
            Ok(library) => {
                debug!(
                    "Loaded library with {} tracks and {} playlists, next track ID {}",
                    library.tracks.len(),
                    library.playlists.len(),
                    library.next_track_id
                );
                Ok(library)
            }
            Err(reason) => {
                warn!(
                    "Existing library {} is malformed ({}), it will be replaced by a new library",
                    path.display(),
                    reason
                );
                Ok(Self::new(music_folder))
            }
        }
    }

    /// Parse a library document
    pub fn parse(bytes: &[u8]) -> Result<Self, String> {
        let root = plist::Value::from_reader(Cursor::new(bytes)).map_err(|e| e.to_string())?;
        let root = root
            .as_dictionary()
            .ok_or_else(|| "root element is not a dictionary".to_string())?;

        let mut header = Fields::new();
        let mut tracks: BTreeMap<u64, Fields> = BTreeMap::new();
        let mut playlists = Vec::new();

        for (key, value) in root.iter() {
            match key.as_str() {
                "Tracks" => {
                    let dict = value
                        .as_dictionary()
                        .ok_or_else(|| "Tracks is not a dictionary".to_string())?;
                    for (id, entry) in dict.iter() {
                        let Ok(id) = id.parse::<u64>() else {
                            debug!("Ignoring non-numeric track key {:?}", id);
                            continue;
                        };
                        let Some(entry) = entry.as_dictionary() else {
                            continue;
                        };
                        let mut fields = fields_from_plist(entry);
                        fields.remove("Track ID");
                        tracks.insert(id, fields);
                    }
                }
                "Playlists" => {
                    let array = value
                        .as_array()
                        .ok_or_else(|| "Playlists is not an array".to_string())?;
                    for entry in array.iter().filter_map(plist::Value::as_dictionary) {
                        playlists.push(parse_playlist(entry));
                    }
                }
                _ => {
                    if let Some(v) = Value::from_plist(value) {
                        header.insert(key.clone(), v);
                    }
                }
            }
        }

        let next_track_id = tracks.keys().next_back().map_or(1, |max| max + 1);
        Ok(Self {
            header,
            tracks,
            playlists,
            next_track_id,
        })
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    pub fn playlist_count(&self) -> usize {
        self.playlists.len()
    }

    pub fn playlist(&self, name: &str) -> Option<&PlaylistEntry> {
        self.playlists.iter().find(|p| p.name() == Some(name))
    }

    /// Location of a track entry, when it has one
    pub fn track_location(&self, id: u64) -> Option<&str> {
        self.tracks
            .get(&id)
            .and_then(|fields| fields.get("Location"))
            .and_then(Value::as_str)
    }

    /// Add tracks that are not in the library yet and return every track's ID
    ///
    /// Tracks are matched by file location; a known location keeps its ID.
    pub fn merge_tracks(&mut self, records: &[&LocalTrackRecord]) -> Vec<u64> {
        let mut known: HashMap<PathBuf, u64> = HashMap::new();
        for (id, fields) in &self.tracks {
            if let Some(location) = fields.get("Location").and_then(Value::as_str) {
                known.entry(location_to_path(location)).or_insert(*id);
            }
        }

        let mut ids = Vec::with_capacity(records.len());
        let mut added = 0;

        for record in records {
            if let Some(id) = known.get(&record.path) {
                debug!("Reusing track ID {} for {}", id, record.title);
                ids.push(*id);
                continue;
            }

            let id = self.next_track_id;
            self.next_track_id += 1;
            self.tracks.insert(id, track_fields(record));
            known.insert(record.path.clone(), id);
            ids.push(id);
            added += 1;
            debug!("Added track ID {} for {}", id, record.title);
        }

        info!(
            "iTunes library: {} new tracks, {} reused",
            added,
            records.len() - added
        );
        ids
    }

    /// Create a playlist, or replace the items of the matching one
    ///
    /// With a server guid the persistent ID is derived from the guid, so a
    /// playlist renamed on the server keeps its entry and only its Name
    /// changes. An entry keyed by name alone is adopted by the guid.
    pub fn upsert_playlist(&mut self, name: &str, guid: Option<&str>, track_ids: Vec<u64>) {
        let by_name = persistent_id(&format!("playlist:{}", name));
        let wanted = guid.map_or_else(|| by_name.clone(), |g| persistent_id(&format!("playlist:{}", g)));

        let position = self
            .playlists
            .iter()
            .position(|p| p.persistent_id() == Some(wanted.as_str()))
            .or_else(|| {
                self.playlists.iter().position(|p| {
                    p.name() == Some(name)
                        && p.persistent_id().is_none_or(|id| id == by_name)
                })
            });

        if let Some(existing) = position.map(|idx| &mut self.playlists[idx]) {
            debug!(
                "Replacing playlist {:?}: {} -> {} items",
                name,
                existing.items.len(),
                track_ids.len()
            );
            if existing.name() != Some(name) {
                info!("Renaming iTunes playlist {:?} to {:?}", existing.name(), name);
                existing
                    .fields
                    .insert("Name".to_string(), Value::String(name.to_string()));
            }
            existing
                .fields
                .insert("Playlist Persistent ID".to_string(), Value::String(wanted));
            existing.items = track_ids;
            return;
        }

        let playlist_id = self.playlists.len() as i64 + 1;
        let mut fields = Fields::new();
        fields.insert("Name".to_string(), Value::String(name.to_string()));
        fields.insert("Playlist ID".to_string(), Value::Integer(playlist_id));
        fields.insert("Playlist Persistent ID".to_string(), Value::String(wanted));
        fields.insert("All Items".to_string(), Value::Bool(true));

        debug!("Created playlist {:?} with ID {}", name, playlist_id);
        self.playlists.push(PlaylistEntry {
            fields,
            items: track_ids,
        });
    }

    /// Render the document
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        out.push_str(DOCTYPE);
        out.push('\n');
        out.push_str("<plist version=\"1.0\">\n");
        out.push_str("<dict>\n");

        write_fields(&mut out, &self.header, &HEADER_ORDER, 1);

        write_line(&mut out, 1, "<key>Tracks</key>");
        write_line(&mut out, 1, "<dict>");
        for (id, fields) in &self.tracks {
            write_line(&mut out, 2, &format!("<key>{}</key>", id));
            write_line(&mut out, 2, "<dict>");
            write_field(&mut out, "Track ID", &Value::Integer(*id as i64), 3);
            write_fields(&mut out, fields, &TRACK_ORDER, 3);
            write_line(&mut out, 2, "</dict>");
        }
        write_line(&mut out, 1, "</dict>");

        write_line(&mut out, 1, "<key>Playlists</key>");
        write_line(&mut out, 1, "<array>");
        for playlist in &self.playlists {
            write_line(&mut out, 2, "<dict>");
            write_fields(&mut out, &playlist.fields, &PLAYLIST_ORDER, 3);
            write_line(&mut out, 3, "<key>Playlist Items</key>");
            write_line(&mut out, 3, "<array>");
            for id in &playlist.items {
                write_line(&mut out, 4, "<dict>");
                write_field(&mut out, "Track ID", &Value::Integer(*id as i64), 5);
                write_line(&mut out, 4, "</dict>");
            }
            write_line(&mut out, 3, "</array>");
            write_line(&mut out, 2, "</dict>");
        }
        write_line(&mut out, 1, "</array>");

        out.push_str("</dict>\n");
        out.push_str("</plist>\n");
        out
    }

    /// Write the document to `path`
    pub async fn save(&self, path: &Path) -> io::Result<()> {
        tokio::fs::write(path, self.render()).await?;
        info!(
            "Saved iTunes library with {} tracks and {} playlists to {}",
            self.tracks.len(),
            self.playlists.len(),
            path.display()
        );
        Ok(())
    }
}

fn parse_playlist(entry: &plist::Dictionary) -> PlaylistEntry {
    let mut fields = Fields::new();
    let mut items = Vec::new();

    for (key, value) in entry.iter() {
        if key == "Playlist Items" {
            items = value
                .as_array()
                .map(|array| {
                    array
                        .iter()
                        .filter_map(plist::Value::as_dictionary)
                        .filter_map(|item| item.get("Track ID"))
                        .filter_map(plist::Value::as_unsigned_integer)
                        .collect()
                })
                .unwrap_or_default();
        } else if let Some(v) = Value::from_plist(value) {
            fields.insert(key.clone(), v);
        }
    }

    PlaylistEntry { fields, items }
}

fn track_fields(record: &LocalTrackRecord) -> Fields {
    let location = file_url(&record.path);
    let mut fields = Fields::new();
    fields.insert("Name".to_string(), Value::String(record.title.clone()));
    fields.insert("Artist".to_string(), Value::String(record.artist.clone()));
    fields.insert("Album".to_string(), Value::String(record.album.clone()));
    if record.duration_secs > 0 {
        fields.insert(
            "Total Time".to_string(),
            Value::Integer(record.duration_secs as i64 * 1000),
        );
    }
    fields.insert("Track Type".to_string(), Value::String("File".to_string()));
    fields.insert(
        "Persistent ID".to_string(),
        Value::String(persistent_id(&location)),
    );
    let now = Utc::now();
    fields.insert(
        "Date Added".to_string(),
        Value::Date(DateTime::from_timestamp(now.timestamp(), 0).unwrap_or(now)),
    );
    fields.insert("Location".to_string(), Value::String(location));
    fields
}

/// `file://` URL for a local path
fn file_url(path: &Path) -> String {
    Url::from_file_path(path)
        .map(String::from)
        .unwrap_or_else(|_| format!("file://{}", path.display()))
}

/// Decode a Location value back into a path
///
/// Accepts proper file URLs as well as unencoded `file://` prefixes.
fn location_to_path(location: &str) -> PathBuf {
    Url::parse(location)
        .ok()
        .and_then(|url| url.to_file_path().ok())
        .unwrap_or_else(|| PathBuf::from(location.trim_start_matches("file://")))
}

/// 16 hex digit identifier derived from `seed`
fn persistent_id(seed: &str) -> String {
    let digest = Sha256::digest(seed.as_bytes());
    hex::encode_upper(&digest[..8])
}

/// Characters XML 1.0 cannot carry, even as references
fn is_xml_illegal(c: char) -> bool {
    matches!(c, '\u{0}'..='\u{8}' | '\u{B}' | '\u{C}' | '\u{E}'..='\u{1F}' | '\u{FFFE}' | '\u{FFFF}')
}

fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            c if is_xml_illegal(c) => {}
            _ => escaped.push(c),
        }
    }
    escaped
}

fn write_line(out: &mut String, depth: usize, line: &str) {
    for _ in 0..depth {
        out.push_str("  ");
    }
    out.push_str(line);
    out.push('\n');
}

fn write_field(out: &mut String, key: &str, value: &Value, depth: usize) {
    write_line(out, depth, &format!("<key>{}</key>", escape(key)));
    write_value(out, value, depth);
}

fn write_value(out: &mut String, value: &Value, depth: usize) {
    let element = match value {
        Value::Integer(i) => format!("<integer>{}</integer>", i),
        Value::Real(r) => format!("<real>{}</real>", r),
        Value::String(s) => format!("<string>{}</string>", escape(s)),
        Value::Bool(true) => "<true/>".to_string(),
        Value::Bool(false) => "<false/>".to_string(),
        Value::Date(d) => format!(
            "<date>{}</date>",
            d.to_rfc3339_opts(SecondsFormat::Secs, true)
        ),
        Value::Data(bytes) => format!("<data>{}</data>", general_purpose::STANDARD.encode(bytes)),
        Value::Array(items) if items.is_empty() => "<array/>".to_string(),
        Value::Dict(fields) if fields.is_empty() => "<dict/>".to_string(),
        Value::Array(items) => {
            write_line(out, depth, "<array>");
            for item in items {
                write_value(out, item, depth + 1);
            }
            write_line(out, depth, "</array>");
            return;
        }
        Value::Dict(fields) => {
            write_line(out, depth, "<dict>");
            write_fields(out, fields, &[], depth + 1);
            write_line(out, depth, "</dict>");
            return;
        }
    };
    write_line(out, depth, &element);
}

/// Write `fields` with the keys in `order` first, then the rest by name
fn write_fields(out: &mut String, fields: &Fields, order: &[&str], depth: usize) {
    for key in order {
        if let Some(value) = fields.get(*key) {
            write_field(out, key, value, depth);
        }
    }
    for (key, value) in fields {
        if !order.contains(&key.as_str()) {
            write_field(out, key, value, depth);
        }
    }
}
