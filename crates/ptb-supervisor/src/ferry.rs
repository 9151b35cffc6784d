//! §4.3 step 5: ferry framed messages between the protocol dispatcher and
//! the Instance's control stream.

use anyhow::{Context, Result};
use ptb_core::protocol::{Downstream, FrameDecoder, Upstream, read_frame, write_frame};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

/// Runs until the stream closes or an `Upstream` sender is dropped.
///
/// Every downstream frame is parsed and forwarded on `downstream_tx`; every
/// message received on `upstream_rx` is serialised and written to the
/// stream. The two directions run concurrently so a slow Agent on one side
/// never blocks delivery on the other.
pub async fn run<S>(
    stream: S,
    downstream_tx: mpsc::Sender<Downstream>,
    mut upstream_rx: mpsc::Receiver<Upstream>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut decoder = FrameDecoder::new();

    loop {
        tokio::select! {
            frame = read_frame(&mut reader, &mut decoder) => {
                match frame.context("reading control frame")? {
                    None => return Ok(()),
                    Some(bytes) => {
                        let message: Downstream = serde_json::from_slice(&bytes)
                            .context("decoding downstream message")?;
                        if downstream_tx.send(message).await.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
            outgoing = upstream_rx.recv() => {
                match outgoing {
                    None => return Ok(()),
                    Some(message) => {
                        let bytes = serde_json::to_vec(&message).context("encoding upstream message")?;
                        write_frame(&mut writer, &bytes).await.context("writing control frame")?;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ptb_core::protocol::{DownstreamMessage, UpstreamMessage};
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_ferry_forwards_downstream_and_writes_upstream() {
        let (mut test_side, supervisor_side) = duplex(4096);

        let (down_tx, mut down_rx) = mpsc::channel(4);
        let (up_tx, up_rx) = mpsc::channel(4);

        let ferry = tokio::spawn(run(supervisor_side, down_tx, up_rx));

        let started = Downstream {
            name: "alice".to_string(),
            message: DownstreamMessage::Started,
        };
        let bytes = serde_json::to_vec(&started).unwrap();
        write_frame(&mut test_side, &bytes).await.unwrap();

        let received = down_rx.recv().await.unwrap();
        assert_eq!(received.name, "alice");
        assert!(matches!(received.message, DownstreamMessage::Started));

        up_tx
            .send(Upstream {
                name: "alice".to_string(),
                message: UpstreamMessage::Null,
            })
            .await
            .unwrap();

        let mut decoder = FrameDecoder::new();
        let frame = read_frame(&mut test_side, &mut decoder).await.unwrap().unwrap();
        let parsed: Upstream = serde_json::from_slice(&frame).unwrap();
        assert!(matches!(parsed.message, UpstreamMessage::Null));

        drop(up_tx);
        drop(test_side);
        let _ = ferry.await.unwrap();
    }
}
