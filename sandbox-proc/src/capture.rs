use tokio::io::{AsyncRead, AsyncReadExt};

const CHUNK: usize = 8192;

/// Bytes read from a child pipe, capped at a fixed size.
#[derive(Debug, Default)]
pub(crate) struct Captured {
    pub bytes: Vec<u8>,
    pub truncated: bool,
}

/// Read `reader` to EOF keeping at most `limit` bytes.
///
/// Everything past the limit is read and discarded so the writer never
/// blocks on a full pipe.
pub(crate) async fn read_capped<R>(mut reader: R, limit: usize) -> Captured
where
    R: AsyncRead + Unpin,
{
    let mut captured = Captured::default();
    let mut chunk = [0u8; CHUNK];
    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        };
        let room = limit.saturating_sub(captured.bytes.len());
        let keep = n.min(room);
        if let Some(part) = chunk.get(..keep) {
            captured.bytes.extend_from_slice(part);
        }
        if keep < n {
            captured.truncated = true;
        }
    }
    captured
}
