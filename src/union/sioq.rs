//! The side-IO queue: a single worker thread that performs branch
//! operations needing a context other than the caller's, such as opacity
//! probes and whiteout deletion under directories the calling process may
//! not be able to search. Requests are a tagged union of operation kind
//! plus arguments, submitted over a channel and awaited synchronously.

use std::ffi::OsString;
use std::fs;
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use crate::union::convert::io_error_to_errno;
use crate::union::whiteout::Whiteout;

#[derive(Debug)]
pub(crate) enum SideIoRequest {
    /// Does `dir` contain the opacity marker?
    IsOpaque { dir: PathBuf },
    /// Probe for the object at `path`; answers whether it exists.
    Lookup { path: PathBuf },
    /// Create an empty regular file (a whiteout) at `path` with `mode`.
    Create { path: PathBuf, mode: u32 },
    /// Unlink one file.
    Unlink { path: PathBuf },
    /// Remove the whiteout markers for `names` inside `dir`.
    DeleteWhiteouts { dir: PathBuf, names: Vec<OsString> },
}

#[derive(Debug)]
pub(crate) enum SideIoReply {
    Exists(bool),
    Done,
}

type SideIoResult = Result<SideIoReply, i32>;

struct Envelope {
    request: SideIoRequest,
    reply: mpsc::Sender<SideIoResult>,
}

/// Handle to the worker. Dropping it closes the channel and joins the
/// worker. The sender sits behind a mutex so the queue can be shared by
/// reference across operation threads.
pub(crate) struct SideIo {
    tx: Option<parking_lot::Mutex<mpsc::Sender<Envelope>>>,
    worker: Option<JoinHandle<()>>,
}

impl SideIo {
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel::<Envelope>();
        let worker = thread::Builder::new()
            .name("stratafs-sioq".to_string())
            .spawn(move || {
                while let Ok(env) = rx.recv() {
                    let result = Self::serve(env.request);
                    // Receiver gone means the submitter gave up; fine.
                    let _ = env.reply.send(result);
                }
            })
            .expect("failed to spawn side-IO worker");

        SideIo {
            tx: Some(parking_lot::Mutex::new(tx)),
            worker: Some(worker),
        }
    }

    fn serve(request: SideIoRequest) -> SideIoResult {
        match request {
            SideIoRequest::IsOpaque { dir } => {
                let marker = Whiteout::opaque_path(&dir);
                match fs::symlink_metadata(&marker) {
                    Ok(_) => Ok(SideIoReply::Exists(true)),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        Ok(SideIoReply::Exists(false))
                    }
                    Err(e) => Err(io_error_to_errno(&e)),
                }
            }
            SideIoRequest::Lookup { path } => match fs::symlink_metadata(&path) {
                Ok(_) => Ok(SideIoReply::Exists(true)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    Ok(SideIoReply::Exists(false))
                }
                Err(e) => Err(io_error_to_errno(&e)),
            },
            SideIoRequest::Create { path, mode } => {
                use std::os::unix::fs::OpenOptionsExt;
                fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .mode(mode)
                    .open(&path)
                    .map(|_| SideIoReply::Done)
                    .map_err(|e| io_error_to_errno(&e))
            }
            SideIoRequest::Unlink { path } => fs::remove_file(&path)
                .map(|_| SideIoReply::Done)
                .map_err(|e| io_error_to_errno(&e)),
            SideIoRequest::DeleteWhiteouts { dir, names } => {
                for name in names {
                    let marker = Whiteout::marker_path(&dir, &name);
                    fs::remove_file(&marker).map_err(|e| io_error_to_errno(&e))?;
                }
                Ok(SideIoReply::Done)
            }
        }
    }

    /// Submit a request and wait for the worker's answer.
    pub fn submit(&self, request: SideIoRequest) -> SideIoResult {
        let (reply_tx, reply_rx) = mpsc::channel();
        let tx = self
            .tx
            .as_ref()
            .expect("side-IO queue stopped")
            .lock()
            .clone();
        tx.send(Envelope {
            request,
            reply: reply_tx,
        })
        .map_err(|_| libc::EIO)?;
        reply_rx.recv().map_err(|_| libc::EIO)?
    }

    /// Convenience wrapper for the opacity probe.
    pub fn is_opaque(&self, dir: PathBuf) -> Result<bool, i32> {
        match self.submit(SideIoRequest::IsOpaque { dir })? {
            SideIoReply::Exists(b) => Ok(b),
            SideIoReply::Done => Ok(false),
        }
    }
}

impl Drop for SideIo {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    #[test]
    fn test_is_opaque_probe() {
        let tmp = tempfile::tempdir().unwrap();
        let sioq = SideIo::spawn();

        assert!(!sioq.is_opaque(tmp.path().to_path_buf()).unwrap());
        fs::write(Whiteout::opaque_path(tmp.path()), b"").unwrap();
        assert!(sioq.is_opaque(tmp.path().to_path_buf()).unwrap());
    }

    #[test]
    fn test_create_and_unlink() {
        let tmp = tempfile::tempdir().unwrap();
        let sioq = SideIo::spawn();
        let path = tmp.path().join(".wh.victim");

        sioq.submit(SideIoRequest::Create {
            path: path.clone(),
            mode: 0o644,
        })
        .unwrap();
        assert!(path.exists());

        // create_new on an existing whiteout is EEXIST
        let err = sioq
            .submit(SideIoRequest::Create {
                path: path.clone(),
                mode: 0o644,
            })
            .unwrap_err();
        assert_eq!(err, libc::EEXIST);

        sioq.submit(SideIoRequest::Unlink { path: path.clone() }).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_delete_whiteouts() {
        let tmp = tempfile::tempdir().unwrap();
        let sioq = SideIo::spawn();

        fs::write(tmp.path().join(".wh.a"), b"").unwrap();
        fs::write(tmp.path().join(".wh.b"), b"").unwrap();

        sioq.submit(SideIoRequest::DeleteWhiteouts {
            dir: tmp.path().to_path_buf(),
            names: vec![OsStr::new("a").into(), OsStr::new("b").into()],
        })
        .unwrap();

        assert!(!tmp.path().join(".wh.a").exists());
        assert!(!tmp.path().join(".wh.b").exists());
    }
}
