//! FIFO transport adapter
//!
//! Each stdio participant gets a FIFO pair under the fifo directory:
//! `<pid>-in` (gateway writes, participant reads) and `<pid>-out`
//! (participant writes, gateway reads), both `Content-Length`-framed.
//!
//! The read side reopens on EOF with a cleared decode buffer, so the
//! channel survives the participant process restarting behind the same
//! pipe. The write side opens lazily: outbound frames queue on the channel
//! until a reader appears on `<pid>-in`.
//!
//! FIFOs are a Unix facility; on other platforms setup fails when any
//! participant is configured for stdio.

use crate::space::channel::{ChannelId, EventSender, GatewayEvent, Outbound, channel_pair};
use anyhow::Result;
use mew_core::framing::LspFrameCodec;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Backoff between reopen/open attempts on a FIFO.
const FIFO_BACKOFF: std::time::Duration = std::time::Duration::from_millis(200);

/// Default FIFO directory under the space dir.
pub fn default_fifo_dir(space_dir: &Path) -> PathBuf {
    space_dir.join(".mew/fifos")
}

/// Create the FIFO pair for every stdio participant and spawn the
/// read/write tasks feeding the core. Returns once all pairs exist;
/// creation failures abort startup.
pub fn spawn_fifo_channels(
    fifo_dir: &Path,
    participant_ids: &[String],
    events: EventSender,
    cancel: CancellationToken,
) -> Result<()> {
    if participant_ids.is_empty() {
        return Ok(());
    }

    #[cfg(unix)]
    {
        std::fs::create_dir_all(fifo_dir).map_err(|err| {
            anyhow::anyhow!("failed to create FIFO dir {}: {err}", fifo_dir.display())
        })?;

        for participant_id in participant_ids {
            let in_path = fifo_dir.join(format!("{participant_id}-in"));
            let out_path = fifo_dir.join(format!("{participant_id}-out"));
            ensure_fifo(&in_path)?;
            ensure_fifo(&out_path)?;

            let (handle, outbound) = channel_pair();
            let channel_id = handle.id();
            if events.try_send(GatewayEvent::Connected { handle }).is_err() {
                anyhow::bail!("space core is not accepting connections");
            }
            info!(
                "FIFO channel {channel_id} for {participant_id}: {} / {}",
                in_path.display(),
                out_path.display()
            );

            tokio::spawn(read_loop(
                out_path,
                channel_id,
                events.clone(),
                cancel.clone(),
            ));
            tokio::spawn(write_loop(in_path, outbound, cancel.clone()));
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        let _ = (fifo_dir, events, cancel);
        anyhow::bail!("FIFO transport requires a Unix platform")
    }
}

#[cfg(unix)]
fn ensure_fifo(path: &Path) -> Result<()> {
    use std::os::unix::fs::FileTypeExt;

    if let Ok(metadata) = std::fs::metadata(path) {
        if metadata.file_type().is_fifo() {
            return Ok(());
        }
        anyhow::bail!("{} exists and is not a FIFO", path.display());
    }

    let c_path = std::ffi::CString::new(path.as_os_str().as_encoded_bytes().to_vec())
        .map_err(|_| anyhow::anyhow!("FIFO path contains a NUL byte"))?;
    // SAFETY: mkfifo only reads the NUL-terminated path string.
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        anyhow::bail!("mkfifo {} failed: {err}", path.display());
    }
    Ok(())
}

/// Read `<pid>-out` until cancellation. EOF means the writer went away;
/// reopen after a short backoff with a cleared buffer and keep the channel
/// alive for the next participant instance.
#[cfg(unix)]
async fn read_loop(
    path: PathBuf,
    channel_id: ChannelId,
    events: EventSender,
    cancel: CancellationToken,
) {
    use tokio::io::AsyncReadExt;

    let mut codec = LspFrameCodec::new();
    let mut buf = vec![0u8; 8192];

    'reopen: loop {
        // Opening the read side blocks until a writer appears.
        let mut file = tokio::select! {
            _ = cancel.cancelled() => return,
            opened = tokio::fs::File::open(&path) => {
                match opened {
                    Ok(file) => file,
                    Err(err) => {
                        warn!("Failed to open FIFO {}: {err}", path.display());
                        tokio::time::sleep(FIFO_BACKOFF).await;
                        continue 'reopen;
                    }
                }
            }
        };
        codec.clear();
        debug!("FIFO {} open for reading", path.display());

        loop {
            let n = tokio::select! {
                _ = cancel.cancelled() => return,
                read = file.read(&mut buf) => {
                    match read {
                        Ok(n) => n,
                        Err(err) => {
                            warn!("FIFO read error on {}: {err}", path.display());
                            tokio::time::sleep(FIFO_BACKOFF).await;
                            continue 'reopen;
                        }
                    }
                }
            };
            if n == 0 {
                debug!("FIFO writer for {} disconnected; reopening", path.display());
                tokio::time::sleep(FIFO_BACKOFF).await;
                continue 'reopen;
            }

            codec.feed(&buf[..n]);
            loop {
                match codec.next_frame() {
                    Ok(Some(text)) => {
                        if events
                            .send(GatewayEvent::Frame { channel_id, text })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        let _ = events
                            .send(GatewayEvent::Malformed {
                                channel_id,
                                reason: err.to_string(),
                            })
                            .await;
                    }
                }
            }
        }
    }
}

/// Drain the outbound queue into `<pid>-in`, opening the write side only
/// once a reader exists. A broken pipe drops the writer and waits for the
/// next reader; the frame being written is retried against it.
#[cfg(unix)]
async fn write_loop(
    path: PathBuf,
    mut outbound: mpsc::Receiver<Outbound>,
    cancel: CancellationToken,
) {
    use tokio::io::AsyncWriteExt;

    let mut writer: Option<tokio::fs::File> = None;

    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => return,
            item = outbound.recv() => {
                match item {
                    Some(item) => item,
                    None => return,
                }
            }
        };

        match item {
            Outbound::Frame(frame) => {
                let bytes = LspFrameCodec::encode(&frame);
                loop {
                    if writer.is_none() {
                        match wait_for_reader(&path, &cancel).await {
                            Some(file) => writer = Some(file),
                            None => return,
                        }
                    }
                    let Some(file) = writer.as_mut() else {
                        return;
                    };
                    match file.write_all(&bytes).await {
                        Ok(()) => {
                            let _ = file.flush().await;
                            break;
                        }
                        Err(err) => {
                            debug!(
                                "FIFO write to {} failed ({err}); waiting for a new reader",
                                path.display()
                            );
                            writer = None;
                        }
                    }
                }
            }
            Outbound::Close => {
                debug!("FIFO channel for {} closed", path.display());
                return;
            }
        }
    }
}

/// Poll for a reader on the FIFO: a non-blocking write open succeeds only
/// once the read side is held; then reopen blocking for real writes.
#[cfg(unix)]
async fn wait_for_reader(path: &Path, cancel: &CancellationToken) -> Option<tokio::fs::File> {
    use std::os::unix::fs::OpenOptionsExt;

    loop {
        let probe = std::fs::OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path);
        match probe {
            Ok(probe) => {
                drop(probe);
                match std::fs::OpenOptions::new().write(true).open(path) {
                    Ok(file) => return Some(tokio::fs::File::from_std(file)),
                    Err(err) => {
                        warn!("Failed to open FIFO {} for writing: {err}", path.display());
                    }
                }
            }
            Err(err) if err.raw_os_error() == Some(libc::ENXIO) => {
                // No reader yet; outbound frames keep buffering.
            }
            Err(err) => {
                warn!("FIFO probe on {} failed: {err}", path.display());
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(FIFO_BACKOFF) => {}
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_fifo_creates_and_accepts_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alice-in");
        ensure_fifo(&path).unwrap();

        use std::os::unix::fs::FileTypeExt;
        assert!(std::fs::metadata(&path).unwrap().file_type().is_fifo());

        // Idempotent on an existing FIFO.
        ensure_fifo(&path).unwrap();
    }

    #[test]
    fn test_ensure_fifo_rejects_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alice-in");
        std::fs::write(&path, b"not a fifo").unwrap();
        assert!(ensure_fifo(&path).is_err());
    }

    #[test]
    fn test_default_fifo_dir() {
        assert_eq!(
            default_fifo_dir(Path::new("/tmp/space")),
            PathBuf::from("/tmp/space/.mew/fifos")
        );
    }
}
