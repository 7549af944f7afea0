//! Wrap a root tree in a commit: authorship, timestamp, and the command
//! line that produced it.

use anyhow::{Context, Result, anyhow};

use crate::counters;
use crate::hashing::ObjectId;
use crate::store::{Kind, ObjectStore};

/// Build and store a commit for `tree`. Author and committer are the same
/// `fullname <login@host>` line with the same timestamp, so an identical
/// save commits to an identical oid.
pub fn commit_tree(
    store: &mut dyn ObjectStore,
    tree: &ObjectId,
    parent: Option<&ObjectId>,
    date_seconds: i64,
    argv: &[String],
) -> Result<ObjectId> {
    let userline = userline()?;
    let mut body = String::new();
    body.push_str(&format!("tree {tree}\n"));
    if let Some(p) = parent {
        body.push_str(&format!("parent {p}\n"));
    }
    body.push_str(&format!("author {userline} {date_seconds} +0000\n"));
    body.push_str(&format!("committer {userline} {date_seconds} +0000\n"));
    body.push('\n');
    body.push_str("duffel save\n\nGenerated by command:\n");
    body.push_str(&format!("{argv:?}\n"));

    counters::bump(counters::Op::CommitsWritten);
    store.write_object(Kind::Commit, body.as_bytes())
}

/// The tree a stored commit points at.
pub fn tree_of(commit_payload: &[u8]) -> Result<ObjectId> {
    let text = std::str::from_utf8(commit_payload).context("Commit isn't UTF-8")?;
    let first = text.lines().next().unwrap_or("");
    first
        .strip_prefix("tree ")
        .ok_or_else(|| anyhow!("Commit doesn't start with a tree line"))?
        .parse()
}

fn userline() -> Result<String> {
    let login = login_name();
    let fullname = fullname_for(&login);
    let host = hostname::get()
        .context("Couldn't get hostname")?
        .to_string_lossy()
        .to_string();
    Ok(format!("{fullname} <{login}@{host}>"))
}

fn login_name() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .ok()
        .or_else(|| {
            let uid = rustix::process::getuid().as_raw();
            let passwd = std::fs::read_to_string("/etc/passwd").ok()?;
            passwd_lookup(&passwd, |e| e.uid == uid).map(|e| e.name)
        })
        .unwrap_or_else(|| "nobody".to_owned())
}

/// The display name from the passwd GECOS field, or the login itself when
/// there's nothing better on file.
fn fullname_for(login: &str) -> String {
    std::fs::read_to_string("/etc/passwd")
        .ok()
        .and_then(|passwd| passwd_lookup(&passwd, |e| e.name == login))
        .and_then(|e| e.fullname)
        .unwrap_or_else(|| login.to_owned())
}

struct PasswdEntry {
    name: String,
    uid: u32,
    fullname: Option<String>,
}

fn passwd_lookup(passwd: &str, mut want: impl FnMut(&PasswdEntry) -> bool) -> Option<PasswdEntry> {
    passwd.lines().filter_map(parse_passwd_line).find(|e| want(e))
}

// name:password:uid:gid:gecos:home:shell
fn parse_passwd_line(line: &str) -> Option<PasswdEntry> {
    let fields: Vec<&str> = line.split(':').collect();
    if fields.len() < 5 || fields[0].is_empty() {
        return None;
    }
    let uid = fields[2].parse().ok()?;
    // The full name is the first comma-separated GECOS field.
    let fullname = fields[4]
        .split(',')
        .next()
        .filter(|s| !s.is_empty())
        .map(str::to_owned);
    Some(PasswdEntry {
        name: fields[0].to_owned(),
        uid,
        fullname,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::store::memory::MemoryStore;

    #[test]
    fn commit_references_its_tree() -> Result<()> {
        let mut store = MemoryStore::new();
        let tree = store.new_tree(vec![])?;
        let argv = vec!["duffel".to_owned(), "save".to_owned(), "-t".to_owned()];

        let c1 = commit_tree(&mut store, &tree, None, 1234567890, &argv)?;
        let (kind, payload) = store.read_object(&c1)?;
        assert_eq!(kind, Kind::Commit);
        assert_eq!(tree_of(&payload)?, tree);

        // Deterministic: same inputs, same commit.
        let c2 = commit_tree(&mut store, &tree, None, 1234567890, &argv)?;
        assert_eq!(c1, c2);

        // A parent changes the oid and shows up in the body.
        let c3 = commit_tree(&mut store, &tree, Some(&c1), 1234567890, &argv)?;
        assert_ne!(c1, c3);
        let (_, payload) = store.read_object(&c3)?;
        assert!(std::str::from_utf8(&payload)?.contains(&format!("parent {c1}")));
        Ok(())
    }

    #[test]
    fn passwd_parsing() {
        let passwd = "\
root:x:0:0:root:/root:/bin/bash\n\
daemon:x:1:1::/usr/sbin:/usr/sbin/nologin\n\
mel:x:1000:1000:Mel Kaye,Room 42,,:/home/mel:/bin/sh\n\
broken line without colons\n";

        let mel = passwd_lookup(passwd, |e| e.name == "mel").unwrap();
        assert_eq!(mel.uid, 1000);
        // Only the first GECOS field is the display name.
        assert_eq!(mel.fullname.as_deref(), Some("Mel Kaye"));

        // An empty GECOS field isn't a name.
        let daemon = passwd_lookup(passwd, |e| e.uid == 1).unwrap();
        assert_eq!(daemon.fullname, None);

        assert!(passwd_lookup(passwd, |e| e.name == "nobody").is_none());
    }
}
