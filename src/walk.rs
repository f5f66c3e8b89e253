use crossbeam_channel::{Receiver, Sender, bounded};
use ignore::{WalkBuilder, WalkState, overrides::OverrideBuilder};
use std::{
    mem,
    path::{Path, PathBuf},
    thread,
};

use crate::errors::SigilResult;
use crate::utils::Config;
use crate::utils::ext::is_ir_file;

type Batch = Vec<PathBuf>;

struct Batcher {
    tx:    Sender<Batch>,
    batch: Batch,
    size:  usize,
}
impl Batcher {
    fn push(&mut self, p: PathBuf) {
        self.batch.push(p);
        if self.batch.len() >= self.size {
            self.flush();
        }
    }
    fn flush(&mut self) {
        if !self.batch.is_empty() {
            // receiver gone means the scan was abandoned
            let _ = self.tx.send(mem::take(&mut self.batch));
        }
    }
}
impl Drop for Batcher {
    fn drop(&mut self) { self.flush(); }
}

// ---------------------------------------------------------------------------
/// Walk `root` for IR listings and send *batches* of paths through the
/// returned channel. A file `root` is sent as-is.
pub fn spawn_senders(root: &Path, cfg: &Config) -> SigilResult<Receiver<Batch>> {
    // ----- 1  build ignore/override rules ----------------------------------
    let mut ob = OverrideBuilder::new(root);
    for dir in &cfg.scanner.excluded_directories {
        if let Err(e) = ob.add(&format!("!**/{dir}/**")) {
            tracing::warn!("cannot add ignore pattern ‘{dir}’: {e}");
        }
    }
    let overrides   = ob.build()?;

    // ----- 2  channel & thread pool parameters -----------------------------
    let workers     = cfg.performance.worker_threads.unwrap_or_else(num_cpus::get).max(1);
    let capacity    = workers * cfg.performance.channel_multiplier.max(1);
    let batch_size  = cfg.performance.batch_size.max(1);
    let (tx, rx)    = bounded::<Batch>(capacity);

    let root        = root.to_path_buf();
    let scan_hidden = cfg.scanner.scan_hidden_files;
    let follow      = cfg.scanner.follow_symlinks;
    let vcsignore   = cfg.scanner.read_vcsignore;
    let max_bytes   = cfg.scanner.max_file_size_mb.unwrap_or(0) * 1_048_576;

    // ----- 3  the background walker thread ---------------------------------
    thread::spawn(move || {
        WalkBuilder::new(root)
          .hidden(!scan_hidden)
          .follow_links(follow)
          .git_ignore(vcsignore)
          .threads(workers)
          .overrides(overrides)
          .build_parallel()
          .run(move || {
              let mut b = Batcher {
                  tx:    tx.clone(),
                  batch: Vec::with_capacity(batch_size),
                  size:  batch_size,
              };

              Box::new(move |entry| {
                  let entry = match entry {
                      Ok(e) if e.file_type().is_some_and(|ft| ft.is_file()) => e,
                      Ok(_) => return WalkState::Continue,
                      Err(e) => {
                          tracing::warn!("walk error: {e}");
                          return WalkState::Continue;
                      }
                  };
                  if !is_ir_file(entry.path()) {
                      return WalkState::Continue;
                  }

                  if max_bytes != 0 {
                      match entry.metadata() {
                          Ok(m) if m.len() > max_bytes => {
                              tracing::warn!("skipping {:?}: larger than the size limit", entry.path());
                              return WalkState::Continue;
                          }
                          Err(e) => {
                              tracing::debug!("metadata failed for {:?}: {e}", entry.path());
                              return WalkState::Continue;
                          }
                          _ => {}
                      }
                  }

                  tracing::debug!("sending {:?}", entry.path());
                  b.push(entry.into_path());
                  WalkState::Continue
              })
          });
    });

    Ok(rx)
}

#[test]
fn walker_finds_ir_files_and_skips_excluded_dirs() {
    use std::fs;

    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    fs::create_dir_all(root.join("pkg/sub")).unwrap();
    fs::create_dir_all(root.join("target")).unwrap();
    fs::write(root.join("a.units.json"), "{}").unwrap();
    fs::write(root.join("pkg/sub/b.json"), "{}").unwrap();
    fs::write(root.join("pkg/App.java"), "class App {}").unwrap();
    fs::write(root.join("target/c.json"), "{}").unwrap();

    let mut cfg = Config::default();
    cfg.performance.batch_size = 1;

    let mut found: Vec<String> = spawn_senders(root, &cfg)
        .unwrap()
        .into_iter()
        .flatten()
        .map(|p| p.strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/"))
        .collect();
    found.sort();

    assert_eq!(found, vec!["a.units.json", "pkg/sub/b.json"]);
}
