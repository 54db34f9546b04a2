//! Writes build outcomes into the `extra/<project>/<id>` working set.
//!
//! Layout per record:
//!
//! ```text
//! extra/<project>/<id>/
//!   baseextra.txt          shared vulnerability description
//!   funcname.txt           one " -> " joined chain per line, sink first
//!   funcbody.txt           concatenated bodies per chain, each ended by "\n[SEP]\n"
//!   1/ 2/ ...              call.txt, body.txt, extra.txt per chain
//!   VulPath/extra.txt      the chain of an early stop
//!   PRUNE.txt | STOP.txt   outcome markers
//! ```

use super::tree::{CallTree, NodeId};
use crate::config::Layout;
use anyhow::Context;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const CHAIN_SEPARATOR: &str = "[SEP]";

pub const FALSE_POSITIVE_NOTE: &str = "This issue has been reviewed and determined to be a false positive.\n\nDetails:\n- The reported behavior does not represent an actual security vulnerability.\n- The data flow does not involve untrusted user input.\n- All parameters are either properly escaped or constant values.\n\nConclusion:\nBased on the above analysis, this report is categorized as a false positive and requires no further remediation.";

pub struct ChainMaterializer {
    layout: Layout,
    id: String,
    base_extra: String,
}

impl ChainMaterializer {
    pub fn new(layout: &Layout, id: &str, base_extra: &str) -> Self {
        Self {
            layout: layout.clone(),
            id: id.to_string(),
            base_extra: base_extra.to_string(),
        }
    }

    pub fn dir(&self) -> PathBuf {
        self.layout.extra_dir(&self.id)
    }

    /// Write the chain files for `leaves` and split them into numbered
    /// directories. Returns the `extra.txt` of each numbered directory.
    pub fn write_chains(&self, tree: &CallTree, leaves: &[NodeId]) -> anyhow::Result<Vec<PathBuf>> {
        let mut names = String::new();
        let mut bodies = String::new();
        for leaf in leaves {
            let Some(path_bodies) = tree
                .path_bodies(*leaf)
                .into_iter()
                .collect::<Option<Vec<String>>>()
            else {
                debug!(leaf = %tree.node(*leaf).name, "skipping chain with a missing body");
                continue;
            };
            names.push_str(&tree.path_names(*leaf).join(" -> "));
            names.push('\n');
            bodies.push_str(&path_bodies.concat());
            bodies.push('\n');
            bodies.push_str(CHAIN_SEPARATOR);
            bodies.push('\n');
        }

        write_file(&self.layout.funcname_file(&self.id), &names)?;
        write_file(&self.layout.funcbody_file(&self.id), &bodies)?;
        self.split_chains()
    }

    /// One numbered directory per chain line, built from `funcname.txt` and
    /// `funcbody.txt` so that hand-edited chain files are honoured.
    pub fn split_chains(&self) -> anyhow::Result<Vec<PathBuf>> {
        let names = fs::read_to_string(self.layout.funcname_file(&self.id))
            .context("Failed to read function name chains")?;
        let bodies = fs::read_to_string(self.layout.funcbody_file(&self.id))
            .context("Failed to read function body chains")?;
        let names = names.trim();
        let bodies = bodies.trim();
        if names.is_empty() {
            return Ok(Vec::new());
        }

        let mut written = Vec::new();
        for (idx, (call, body)) in names
            .split('\n')
            .zip(bodies.split(CHAIN_SEPARATOR))
            .enumerate()
        {
            let dir = self.dir().join((idx + 1).to_string());
            let call = call.trim();
            let body = body.trim();
            write_file(&dir.join("call.txt"), &format!("{}\n", call))?;
            write_file(&dir.join("body.txt"), &format!("{}\n", body))?;
            let extra = dir.join("extra.txt");
            write_file(
                &extra,
                &format!(
                    "{}\nFunction call:\n{}\n\nFunction detailed context:\n{}\n",
                    self.base_extra, call, body
                ),
            )?;
            written.push(extra);
        }
        info!(id = %self.id, chains = written.len(), "chains materialized");
        Ok(written)
    }

    /// Record the early-stop chain ending at `node`.
    pub fn write_vulpath(&self, tree: &CallTree, node: NodeId) -> anyhow::Result<PathBuf> {
        let bodies: Vec<String> = tree.path_bodies(node).into_iter().flatten().collect();
        let path = self.layout.vulpath_extra(&self.id);
        write_file(
            &path,
            &format!(
                "{}\nFunction call:\n{}\n\nFunction detailed context:\n{}",
                self.base_extra,
                tree.path_names(node).join(" -> "),
                bodies.join("\n")
            ),
        )?;
        info!(id = %self.id, path = %path.display(), "vulnerable path recorded");
        Ok(path)
    }

    pub fn write_prune_marker(&self) -> anyhow::Result<PathBuf> {
        let path = self.layout.prune_marker(&self.id);
        write_file(&path, FALSE_POSITIVE_NOTE)?;
        Ok(path)
    }

    pub fn write_length_marker(&self, function: &str) -> anyhow::Result<PathBuf> {
        let path = self.layout.length_marker(&self.id);
        write_file(
            &path,
            &format!(
                "[STOP] The body of `{}` is too long to analyze.\n",
                function
            ),
        )?;
        Ok(path)
    }
}

fn write_file(path: &Path, content: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn tree() -> (CallTree, Vec<NodeId>) {
        let mut tree = CallTree::new("sink", Some("int sink() {}\n".into()));
        let root = tree.root();
        let a = tree.add_child(root, "a", Some("void a() { sink(); }\n".into()));
        let b = tree.add_child(root, "b", Some("void b() { sink(); }\n".into()));
        let main = tree.add_child(a, "main", Some("int main() { a(); }\n".into()));
        (tree, vec![main, b])
    }

    #[test]
    fn test_chain_files_and_numbered_dirs() {
        let dir = tempdir().unwrap();
        let layout = Layout::new(dir.path(), "proj");
        let m = ChainMaterializer::new(&layout, "4", "BASE\n");
        let (tree, leaves) = tree();

        let extras = m.write_chains(&tree, &leaves).unwrap();
        assert_eq!(extras.len(), 2);

        let names = fs::read_to_string(layout.funcname_file("4")).unwrap();
        assert_eq!(names, "sink -> a -> main\nsink -> b\n");
        let bodies = fs::read_to_string(layout.funcbody_file("4")).unwrap();
        assert_eq!(bodies.matches("\n[SEP]\n").count(), 2);

        let first = m.dir().join("1");
        assert_eq!(
            fs::read_to_string(first.join("call.txt")).unwrap(),
            "sink -> a -> main\n"
        );
        let extra = fs::read_to_string(first.join("extra.txt")).unwrap();
        assert!(extra.starts_with("BASE\n\nFunction call:\nsink -> a -> main\n\n"));
        assert!(extra.contains("Function detailed context:\nint sink() {}\nvoid a()"));
        assert!(fs::read_to_string(m.dir().join("2").join("body.txt"))
            .unwrap()
            .starts_with("int sink() {}\nvoid b()"));
    }

    #[test]
    fn test_rewriting_is_byte_identical() {
        let dir = tempdir().unwrap();
        let layout = Layout::new(dir.path(), "proj");
        let m = ChainMaterializer::new(&layout, "4", "BASE\n");
        let (tree, leaves) = tree();

        m.write_chains(&tree, &leaves).unwrap();
        let snapshot = |p: &Path| fs::read(p).unwrap();
        let files = [
            layout.funcname_file("4"),
            layout.funcbody_file("4"),
            m.dir().join("1").join("extra.txt"),
            m.dir().join("2").join("extra.txt"),
        ];
        let before: Vec<_> = files.iter().map(|p| snapshot(p)).collect();
        m.write_chains(&tree, &leaves).unwrap();
        let after: Vec<_> = files.iter().map(|p| snapshot(p)).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_chain_with_missing_body_is_skipped() {
        let dir = tempdir().unwrap();
        let layout = Layout::new(dir.path(), "proj");
        let m = ChainMaterializer::new(&layout, "1", "BASE\n");
        let mut tree = CallTree::new("sink", Some("body\n".into()));
        let root = tree.root();
        let hole = tree.add_child(root, "unknown", None);
        let ok = tree.add_child(root, "ok", Some("ok body\n".into()));

        let extras = m.write_chains(&tree, &[hole, ok]).unwrap();
        assert_eq!(extras.len(), 1);
        assert_eq!(
            fs::read_to_string(layout.funcname_file("1")).unwrap(),
            "sink -> ok\n"
        );
    }

    #[test]
    fn test_markers_and_vulpath() {
        let dir = tempdir().unwrap();
        let layout = Layout::new(dir.path(), "proj");
        let m = ChainMaterializer::new(&layout, "2", "BASE\n");
        let (tree, leaves) = tree();

        let vul = m.write_vulpath(&tree, leaves[0]).unwrap();
        let text = fs::read_to_string(vul).unwrap();
        assert!(text.contains("Function call:\nsink -> a -> main\n\n"));

        let prune = m.write_prune_marker().unwrap();
        assert!(fs::read_to_string(prune).unwrap().contains("false positive"));
        let stop = m.write_length_marker("huge").unwrap();
        assert!(fs::read_to_string(stop).unwrap().contains("`huge`"));
    }

    #[test]
    fn test_no_chains_writes_empty_files() {
        let dir = tempdir().unwrap();
        let layout = Layout::new(dir.path(), "proj");
        let m = ChainMaterializer::new(&layout, "9", "BASE\n");
        let tree = CallTree::new("sink", Some("body".into()));
        assert!(m.write_chains(&tree, &[]).unwrap().is_empty());
        assert!(layout.funcname_file("9").exists());
    }
}
