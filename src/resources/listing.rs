// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

//! Rendering of directory listings as self-contained HTML pages.

use std::{
    cmp::Ordering,
    ffi::OsStr,
    fmt::Write,
    fs::{self, Metadata},
    io,
    os::unix::{ffi::OsStrExt, fs::MetadataExt},
    path::PathBuf,
};

use chrono::{DateTime, TimeDelta, Utc};
use hashbrown::HashMap;
use nix::unistd::{getgid, getuid, Gid, Group, Uid, User};

use crate::http::escape;

/// Entries older than this many days show the year instead of the time of
/// day.
const RECENT_DAYS: i64 = 6 * 30;

/// Everything needed to render the listing of one directory.
#[derive(Clone, Debug)]
pub struct ListingRequest {
    /// The directory on disk.
    pub directory: PathBuf,

    /// The request path naming the directory, ending in a slash.
    pub url_path: Vec<u8>,

    pub host: String,
    pub port: u16,
    pub server_name: String,

    /// Show numeric owners, name lookups don't work inside a chroot.
    pub chrooted: bool,
}

struct Entry {
    name: Vec<u8>,
    metadata: Metadata,
    readable: bool,
}

impl Entry {
    fn is_dir(&self) -> bool {
        self.metadata.is_dir()
    }
}

impl ListingRequest {
    pub fn render(&self) -> io::Result<Vec<u8>> {
        self.render_at(Utc::now())
    }

    pub fn render_at(&self, now: DateTime<Utc>) -> io::Result<Vec<u8>> {
        let mut entries = self.read_entries()?;
        entries.sort_by(|a, b| match (a.is_dir(), b.is_dir()) {
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            _ => a.name.cmp(&b.name),
        });

        let mut owners = OwnerNames::new(self.chrooted);
        let mut page = String::with_capacity(4096 + entries.len() * 96);
        let path = escape::html(&self.url_path);

        _ = write!(
            page,
            "<!DOCTYPE html>\n<html><head><title>{}:{}{path}</title></head>\n<body>\n<h1>listing: ",
            escape::html(self.host.as_bytes()),
            self.port,
        );
        self.write_breadcrumbs(&mut page);
        page.push_str("</h1><hr><pre>\n");
        page.push_str("<b>access      user      group     date             size  name</b>\n\n");

        for entry in &entries {
            page.push_str(&mode_string(entry.metadata.mode()));
            page.push_str("  ");
            page.push_str(&owners.user(entry.metadata.uid()));
            page.push_str(&owners.group(entry.metadata.gid()));
            page.push_str(&format_date(entry.metadata.mtime(), now));
            page.push_str(&format_size(&entry.metadata));

            let name = escape::html(&entry.name);
            if entry.readable {
                let slash = if entry.is_dir() { "/" } else { "" };
                _ = writeln!(page, "<a href=\"{}{slash}\">{name}</a>", escape::quote(&entry.name));
            } else {
                _ = writeln!(page, "{name}");
            }
        }

        _ = write!(
            page,
            "</pre><hr>\n<small>{} &nbsp; {}</small>\n</body></html>\n",
            escape::html(self.server_name.as_bytes()),
            now.format("%d/%b/%Y %H:%M:%S GMT"),
        );

        Ok(page.into_bytes())
    }

    /// One link per path prefix, the text of each being its last segment.
    fn write_breadcrumbs(&self, page: &mut String) {
        let path = &self.url_path;
        let mut start = 0;
        let mut end = 1.min(path.len());
        loop {
            _ = write!(
                page,
                "<a href=\"{}\">{}</a>",
                escape::quote(&path[..end]),
                escape::html(&path[start..end]),
            );
            match path[end..].iter().position(|&b| b == b'/') {
                Some(offset) => {
                    start = end;
                    end += offset + 1;
                }
                None => break,
            }
        }
    }

    fn read_entries(&self) -> io::Result<Vec<Entry>> {
        let uid = getuid();
        let gid = getgid();
        let mut entries = Vec::new();

        let mut names = Vec::new();
        if self.url_path != b"/" {
            names.push(b"..".to_vec());
        }
        for entry in fs::read_dir(&self.directory)? {
            names.push(entry?.file_name().as_bytes().to_vec());
        }

        for name in names {
            // Entries can vanish between reading the directory and looking
            // at them.
            let Ok(metadata) = fs::metadata(self.directory.join(OsStr::from_bytes(&name))) else {
                continue;
            };
            let readable = is_readable(&metadata, uid, gid);
            entries.push(Entry { name, metadata, readable });
        }

        Ok(entries)
    }
}

/// Whether the server can read the entry, judged from its permission bits
/// for the server's own user and group.
fn is_readable(metadata: &Metadata, uid: Uid, gid: Gid) -> bool {
    if !metadata.is_dir() && !metadata.is_file() {
        return false;
    }
    let mode = metadata.mode();
    if metadata.uid() == uid.as_raw() && mode & 0o400 != 0 {
        return true;
    }
    if metadata.gid() == gid.as_raw() && mode & 0o040 != 0 {
        return true;
    }
    mode & 0o004 != 0
}

/// `ls -l` style type and permission column, e.g. `drwxr-xr-x`.
fn mode_string(mode: u32) -> String {
    const RWX: [&str; 8] = ["---", "--x", "-w-", "-wx", "r--", "r-x", "rw-", "rwx"];

    let kind = match mode & 0o170000 {
        0o010000 => 'p',
        0o020000 => 'c',
        0o040000 => 'd',
        0o060000 => 'b',
        0o100000 => '-',
        0o120000 => 'l',
        0o140000 => '=',
        _ => '?',
    };

    let mut text = String::with_capacity(10);
    text.push(kind);
    text.push_str(RWX[(mode >> 6) as usize & 7]);
    text.push_str(RWX[(mode >> 3) as usize & 7]);
    text.push_str(RWX[mode as usize & 7]);
    text
}

fn format_date(mtime: i64, now: DateTime<Utc>) -> String {
    let Some(time) = DateTime::<Utc>::from_timestamp(mtime, 0) else {
        return "?                 ".to_owned();
    };
    if now - time > TimeDelta::days(RECENT_DAYS) {
        time.format("%b %d  %Y  ").to_string()
    } else {
        time.format("%b %d %H:%M  ").to_string()
    }
}

/// Sizes stay below 9 of their unit before moving to the next one.
fn format_size(metadata: &Metadata) -> String {
    if metadata.is_dir() {
        return "  &lt;DIR&gt;  ".to_owned();
    }
    if !metadata.is_file() {
        return "     --  ".to_owned();
    }

    const UNITS: [&str; 5] = [" B", "kB", "MB", "GB", "TB"];
    let size = metadata.len();
    let mut shift = 0;
    for unit in &UNITS[..UNITS.len() - 1] {
        if size < 9 << (shift + 10) {
            return format!("{:4} {unit}  ", size >> shift);
        }
        shift += 10;
    }
    format!("{:4} {}  ", size >> shift, UNITS[UNITS.len() - 1])
}

/// Resolves owner and group ids to names, remembering results for the
/// duration of one render.
struct OwnerNames {
    numeric: bool,
    users: HashMap<u32, Option<String>>,
    groups: HashMap<u32, Option<String>>,
}

impl OwnerNames {
    fn new(numeric: bool) -> Self {
        Self { numeric, users: HashMap::new(), groups: HashMap::new() }
    }

    fn user(&mut self, uid: u32) -> String {
        let numeric = self.numeric;
        let name = self.users.entry(uid).or_insert_with(|| {
            if numeric {
                return None;
            }
            User::from_uid(Uid::from_raw(uid)).ok().flatten().map(|user| user.name)
        });
        column(name.as_deref(), uid)
    }

    fn group(&mut self, gid: u32) -> String {
        let numeric = self.numeric;
        let name = self.groups.entry(gid).or_insert_with(|| {
            if numeric {
                return None;
            }
            Group::from_gid(Gid::from_raw(gid)).ok().flatten().map(|group| group.name)
        });
        column(name.as_deref(), gid)
    }
}

fn column(name: Option<&str>, id: u32) -> String {
    match name {
        Some(name) => {
            let name: String = name.chars().take(8).collect();
            format!("{:<8}  ", escape::html(name.as_bytes()))
        }
        None => format!("{id:8}  "),
    }
}

#[cfg(test)]
mod tests {
    use std::{fs::Permissions, os::unix::fs::PermissionsExt};

    use rstest::rstest;

    use super::*;

    fn request(directory: PathBuf, url_path: &str) -> ListingRequest {
        ListingRequest {
            directory,
            url_path: url_path.as_bytes().to_vec(),
            host: "example.org".to_owned(),
            port: 8080,
            server_name: "portiere/test".to_owned(),
            chrooted: true,
        }
    }

    fn render(request: &ListingRequest) -> String {
        String::from_utf8(request.render().unwrap()).unwrap()
    }

    #[test]
    fn readable_entries_are_links_others_plain_text() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        fs::write(dir.path().join("b.txt"), "b").unwrap();
        fs::set_permissions(dir.path().join("b.txt"), Permissions::from_mode(0o000)).unwrap();

        let page = render(&request(dir.path().to_owned(), "/"));
        assert!(page.contains("<a href=\"a.txt\">a.txt</a>"), "{page}");
        assert!(page.contains(" b.txt\n"), "{page}");
        assert!(!page.contains("href=\"b.txt\""), "{page}");
    }

    #[test]
    fn directories_first_then_by_name() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("aaa"), "").unwrap();
        fs::create_dir(dir.path().join("zzz")).unwrap();
        fs::write(dir.path().join("bbb"), "").unwrap();

        let page = render(&request(dir.path().to_owned(), "/"));
        let zzz = page.find("zzz/").unwrap();
        let aaa = page.find(">aaa<").unwrap();
        let bbb = page.find(">bbb<").unwrap();
        assert!(zzz < aaa && aaa < bbb, "{page}");
        assert!(page.contains("&lt;DIR&gt;"));
    }

    #[test]
    fn parent_link_is_hidden_at_the_root_only() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!render(&request(dir.path().to_owned(), "/")).contains("href=\"../\""));
        assert!(render(&request(dir.path().to_owned(), "/sub/")).contains("href=\"../\""));
    }

    #[test]
    fn names_are_escaped_and_quoted() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("x <y>.txt"), "").unwrap();

        let page = render(&request(dir.path().to_owned(), "/"));
        assert!(page.contains("<a href=\"x%20<y>.txt\">x &lt;y&gt;.txt</a>"), "{page}");
    }

    #[test]
    fn title_and_breadcrumbs() {
        let dir = tempfile::tempdir().unwrap();
        let page = render(&request(dir.path().to_owned(), "/a b/c/"));
        assert!(page.contains("<title>example.org:8080/a b/c/</title>"), "{page}");
        assert!(
            page.contains("<a href=\"/\">/</a><a href=\"/a%20b/\">a b/</a><a href=\"/a%20b/c/\">c/</a></h1>"),
            "{page}"
        );
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = request(dir.path().join("nope"), "/nope/").render();
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::NotFound);
    }

    #[rstest]
    #[case(0o040755, "drwxr-xr-x")]
    #[case(0o100644, "-rw-r--r--")]
    #[case(0o100000, "----------")]
    #[case(0o120777, "lrwxrwxrwx")]
    #[case(0o010600, "prw-------")]
    fn mode_strings(#[case] mode: u32, #[case] expected: &str) {
        assert_eq!(mode_string(mode), expected);
    }

    #[test]
    fn dates_switch_to_year_after_six_months() {
        let now = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        assert_eq!(format_date(1_700_000_000 - 3600, now), "Nov 14 21:13  ");
        assert_eq!(format_date(1_600_000_000, now), "Sep 13  2020  ");
    }

    #[test]
    fn sizes_are_scaled() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        let cases = [(100, " 100  B  "), (9 * 1024, "   9 kB  "), (20 * 1024 * 1024, "  20 MB  ")];
        for (size, expected) in cases {
            fs::File::create(&file).unwrap().set_len(size).unwrap();
            assert_eq!(format_size(&fs::metadata(&file).unwrap()), expected);
        }
    }

    #[test]
    fn numeric_owner_columns() {
        assert_eq!(column(None, 1000), "    1000  ");
        assert_eq!(column(Some("averylongname"), 0), "averylon  ");
    }
}
