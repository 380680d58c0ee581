//! The output side: SVN dumpfile emission and `svnadmin load`.
//!
//! The dumpfile writer is a repository-mirror delegate producing an SVN
//! dump format v2 stream. Loading into a live repository reuses the same
//! writer, pointed at the stdin of an `svnadmin load` child process.

use std::env;
use std::fmt::Write as _;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::bail;
use anyhow::Context as _;
use anyhow::Result;
use chrono::DateTime;
use subprocess::Exec;
use subprocess::Popen;
use subprocess::PopenConfig;
use subprocess::Redirection;

use crate::mirror::NodeKind;
use crate::mirror::PathItem;
use crate::mirror::RepositoryDelegate;
use crate::mirror::RevProps;
use crate::rcs::RevNum;

fn co_cmd() -> &'static String {
    static CO_CMD: OnceLock<String> = OnceLock::new();
    CO_CMD.get_or_init(|| env::var("RCS_CO").unwrap_or_else(|_| "co".to_string()))
}

/// Retrieves the contents of a file revision.
pub trait ContentReader {
    fn read(&mut self, rcs_path: &str, rev: &RevNum) -> Result<Vec<u8>>;
}

/// The default reader: `co -q -p<REV> <rcs_path>`.
#[derive(Debug, Default)]
pub struct CoContentReader;

impl ContentReader for CoContentReader {
    fn read(&mut self, rcs_path: &str, rev: &RevNum) -> Result<Vec<u8>> {
        let capture = Exec::cmd(co_cmd())
            .arg("-q")
            .arg(format!("-p{}", rev))
            .arg(rcs_path)
            .stdout(Redirection::Pipe)
            .stderr(Redirection::Pipe)
            .capture()
            .with_context(|| format!("failed to run {}; are the RCS tools installed?", co_cmd()))?;
        if !capture.exit_status.success() {
            bail!(
                "{} failed for {} r{}: {}",
                co_cmd(),
                rcs_path,
                rev,
                capture.stderr_str().trim()
            );
        }
        Ok(capture.stdout)
    }
}

fn format_date(timestamp: i64) -> String {
    let date = DateTime::from_timestamp(timestamp, 0).unwrap_or(DateTime::UNIX_EPOCH);
    date.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

fn props_block(props: &[(&str, &str)]) -> String {
    let mut block = String::new();
    for (key, value) in props {
        write!(block, "K {}\n{}\nV {}\n{}\n", key.len(), key, value.len(), value).unwrap();
    }
    block.push_str("PROPS-END\n");
    block
}

/// Writes the operation stream as an SVN dumpfile (format version 2).
pub struct DumpfileWriter<W: Write> {
    out: W,
    reader: Box<dyn ContentReader>,
}

impl<W: Write> DumpfileWriter<W> {
    pub fn new(mut out: W, reader: Box<dyn ContentReader>) -> Result<Self> {
        out.write_all(b"SVN-fs-dump-format-version: 2\n\n")?;
        Ok(Self { out, reader })
    }

    fn node_headers(&mut self, headers: &[(&str, String)]) -> Result<()> {
        for (key, value) in headers {
            writeln!(self.out, "{}: {}", key, value)?;
        }
        Ok(())
    }

    fn file_node(&mut self, action: &str, item: &PathItem, with_props: bool) -> Result<()> {
        let text = self.reader.read(&item.rcs_path, &item.rev)?;
        let props = if with_props {
            let mut pairs = Vec::new();
            if item.executable {
                pairs.push(("svn:executable", "*"));
            }
            Some(props_block(&pairs))
        } else {
            None
        };

        let prop_len = props.as_ref().map_or(0, |p| p.len());
        let mut headers = vec![
            ("Node-path", item.path.clone()),
            ("Node-kind", "file".to_string()),
            ("Node-action", action.to_string()),
        ];
        if let Some(props) = &props {
            headers.push(("Prop-content-length", props.len().to_string()));
        }
        headers.push(("Text-content-length", text.len().to_string()));
        headers.push(("Content-length", (prop_len + text.len()).to_string()));

        self.node_headers(&headers)?;
        self.out.write_all(b"\n")?;
        if let Some(props) = props {
            self.out.write_all(props.as_bytes())?;
        }
        self.out.write_all(&text)?;
        self.out.write_all(b"\n\n")?;
        Ok(())
    }
}

impl<W: Write> RepositoryDelegate for DumpfileWriter<W> {
    fn start_commit(&mut self, revnum: u32, props: &RevProps) -> Result<()> {
        let mut pairs: Vec<(&str, &str)> = Vec::new();
        if let Some(author) = &props.author {
            pairs.push(("svn:author", author));
        }
        let date = format_date(props.date);
        pairs.push(("svn:date", &date));
        pairs.push(("svn:log", &props.log));
        let block = props_block(&pairs);

        writeln!(self.out, "Revision-number: {}", revnum)?;
        writeln!(self.out, "Prop-content-length: {}", block.len())?;
        writeln!(self.out, "Content-length: {}", block.len())?;
        self.out.write_all(b"\n")?;
        self.out.write_all(block.as_bytes())?;
        self.out.write_all(b"\n")?;
        Ok(())
    }

    fn mkdir(&mut self, path: &str) -> Result<()> {
        self.node_headers(&[
            ("Node-path", path.to_string()),
            ("Node-kind", "dir".to_string()),
            ("Node-action", "add".to_string()),
        ])?;
        self.out.write_all(b"\n\n")?;
        Ok(())
    }

    fn add_path(&mut self, item: &PathItem) -> Result<()> {
        self.file_node("add", item, true)
    }

    fn change_path(&mut self, item: &PathItem) -> Result<()> {
        self.file_node("change", item, false)
    }

    fn delete_path(&mut self, path: &str) -> Result<()> {
        self.node_headers(&[
            ("Node-path", path.to_string()),
            ("Node-action", "delete".to_string()),
        ])?;
        self.out.write_all(b"\n\n")?;
        Ok(())
    }

    fn copy_path(&mut self, src: &str, src_revnum: u32, dest: &str, kind: NodeKind) -> Result<()> {
        self.node_headers(&[
            ("Node-path", dest.to_string()),
            ("Node-kind", kind.to_string()),
            ("Node-action", "add".to_string()),
            ("Node-copyfrom-rev", src_revnum.to_string()),
            ("Node-copyfrom-path", src.to_string()),
        ])?;
        self.out.write_all(b"\n\n")?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

/// A live `svnadmin load` target.
///
/// `create` spawns the child and hands back its stdin for a
/// [DumpfileWriter]; the stdin must be dropped (closing the pipe) before
/// [SvnRepositoryLoader::finish] is called.
pub struct SvnRepositoryLoader {
    child: Popen,
}

impl SvnRepositoryLoader {
    pub fn create(
        repo_path: &Path,
        bdb_txn_nosync: bool,
    ) -> Result<(Self, std::fs::File)> {
        let mut create = Exec::cmd("svnadmin").arg("create");
        if bdb_txn_nosync {
            create = create.arg("--bdb-txn-nosync");
        }
        let capture = create
            .arg(repo_path)
            .stdout(Redirection::Pipe)
            .stderr(Redirection::Pipe)
            .capture()
            .context("failed to run svnadmin; is Subversion installed?")?;
        if !capture.exit_status.success() {
            bail!("svnadmin create failed: {}", capture.stderr_str().trim());
        }

        let mut child = Popen::create(
            &[
                "svnadmin".as_ref(),
                "load".as_ref(),
                "-q".as_ref(),
                repo_path.as_os_str(),
            ],
            PopenConfig {
                stdin: Redirection::Pipe,
                stderr: Redirection::Pipe,
                ..Default::default()
            },
        )
        .context("failed to start svnadmin load")?;
        let stdin = child.stdin.take().expect("stdin was requested as a pipe");
        Ok((Self { child }, stdin))
    }

    /// Await the child after the dump stream is complete.
    pub fn finish(mut self) -> Result<()> {
        let status = self.child.wait()?;
        let mut stderr = String::new();
        if let Some(pipe) = self.child.stderr.as_mut() {
            let _ = pipe.read_to_string(&mut stderr);
        }
        if !status.success() {
            bail!("svnadmin load failed: {}", stderr.trim());
        }
        // svnadmin load -q is expected to be silent; anything on stderr
        // means the repository cannot be trusted.
        if !stderr.trim().is_empty() {
            bail!("svnadmin load reported: {}", stderr.trim());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeReader;

    impl ContentReader for FakeReader {
        fn read(&mut self, _rcs_path: &str, rev: &RevNum) -> Result<Vec<u8>> {
            Ok(format!("content of {}\n", rev).into_bytes())
        }
    }

    fn writer() -> DumpfileWriter<Vec<u8>> {
        DumpfileWriter::new(Vec::new(), Box::new(FakeReader)).unwrap()
    }

    fn item(path: &str, executable: bool) -> PathItem {
        PathItem {
            path: path.to_string(),
            rcs_path: format!("/repo/{},v", path),
            rev: "1.1".parse().unwrap(),
            executable,
        }
    }

    #[test]
    fn header_and_revision_record() {
        let mut w = writer();
        let props = RevProps {
            author: Some("jrandom".to_string()),
            date: 1044973263,
            log: "a change".to_string(),
        };
        w.start_commit(2, &props).unwrap();
        let text = String::from_utf8(w.out).unwrap();
        assert!(text.starts_with("SVN-fs-dump-format-version: 2\n\n"));
        assert!(text.contains("Revision-number: 2\n"));
        assert!(text.contains("K 10\nsvn:author\nV 7\njrandom\n"));
        assert!(text.contains("K 8\nsvn:date\nV 27\n2003-02-11T14:21:03.000000Z\n"));
        assert!(text.contains("K 7\nsvn:log\nV 8\na change\n"));
        assert!(text.contains("PROPS-END\n"));
        // Prop and content lengths agree and describe the block.
        let block_len = text.split("Prop-content-length: ").nth(1).unwrap();
        let block_len: usize = block_len.split('\n').next().unwrap().parse().unwrap();
        let block = text.split("\n\n").nth(2).unwrap();
        assert_eq!(block.len() + 1, block_len); // trailing newline included
    }

    #[test]
    fn file_add_carries_text_and_props() {
        let mut w = writer();
        w.add_path(&item("trunk/tool.sh", true)).unwrap();
        let text = String::from_utf8(w.out).unwrap();
        assert!(text.contains("Node-path: trunk/tool.sh\n"));
        assert!(text.contains("Node-kind: file\n"));
        assert!(text.contains("Node-action: add\n"));
        assert!(text.contains("K 14\nsvn:executable\nV 1\n*\n"));
        assert!(text.contains("Text-content-length: 15\n"));
        assert!(text.contains("content of 1.1\n"));
    }

    #[test]
    fn file_change_has_no_props() {
        let mut w = writer();
        w.change_path(&item("trunk/a", false)).unwrap();
        let text = String::from_utf8(w.out).unwrap();
        assert!(text.contains("Node-action: change\n"));
        assert!(!text.contains("Prop-content-length"));
        assert!(text.contains("Content-length: 15\n"));
    }

    #[test]
    fn deletes_and_copies() {
        let mut w = writer();
        w.delete_path("trunk/old").unwrap();
        w.copy_path("trunk", 3, "tags/REL", NodeKind::Dir).unwrap();
        let text = String::from_utf8(w.out).unwrap();
        assert!(text.contains("Node-path: trunk/old\nNode-action: delete\n"));
        assert!(text.contains(
            "Node-path: tags/REL\nNode-kind: dir\nNode-action: add\n\
             Node-copyfrom-rev: 3\nNode-copyfrom-path: trunk\n"
        ));
    }

    #[test]
    fn output_is_deterministic() {
        let render = || {
            let mut w = writer();
            w.start_commit(2, &RevProps { author: None, date: 0, log: "x".into() }).unwrap();
            w.mkdir("trunk").unwrap();
            w.add_path(&item("trunk/a", false)).unwrap();
            w.finish().unwrap();
            w.out
        };
        assert_eq!(render(), render());
    }
}
