//! The cross-process bridge pair (component C9, `SPEC_FULL.md` section 4.6
//! supplement / `spec.md` section 5).
//!
//! When the executor finds an operator whose declared [`Location`] differs
//! from the local process, it inserts a local [`Egress`] execution node
//! paired with a remote [`Ingress`] node: `egress` serializes outgoing
//! batches over a TCP connection; `ingress`, running in the other process,
//! deserializes them. Back-pressure is preserved across the bridge by
//! waiting for one credit acknowledgment per non-empty batch before sending
//! the next (`spec.md` section 5: "treating each network ack as a credit
//! return"); ticks carry no credit and are sent without waiting. Batches
//! are never reordered -- the wire is a single ordered TCP stream.
//!
//! Grounded in the teacher's `network/tokio/multiplexer.rs`: the same
//! exponential-backoff connection retry loop (`CONNECT_ATTEMPTS`,
//! `RETRY_INITIAL_TIMEOUT`, `RETRY_MAX_TIMEOUT`) and the same "own a
//! dedicated tokio runtime, block on it from a detached OS thread"
//! structure, adapted from a fire-and-forget multiplexed sender to a
//! bounded, acknowledged one-to-one edge. This module implements exactly
//! one connection per bridge pair, matching `spec.md` section 5's "a local
//! egress node ... and a remote ingress node" (singular); fanning one
//! egress out to several ingress peers is a connector concern, out of
//! scope here.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio::time::sleep;

use crate::control::ControlPlane;
use crate::diagnostic::{Diagnostic, Severity, Span};
use crate::element::{AnyBatch, BytesBatch, ElementType, EventsBatch, VoidBatch};
use crate::error::PipelineError;
use crate::operator::{BatchSeq, Location, Operator, Step};
use crate::schema::Schema;

const CONNECT_ATTEMPTS: usize = 32;
const RETRY_INITIAL_TIMEOUT: Duration = Duration::from_millis(8);
const RETRY_MAX_TIMEOUT: Duration = Duration::from_secs(1);

/// The wire envelope for one `events` batch: the schema travels with every
/// batch rather than being negotiated once, trading a little bandwidth for
/// a connection that needs no handshake beyond the TCP accept. `ipc` is the
/// Arrow IPC stream encoding of the batch's columns, so the wire format
/// stays Arrow-compatible end to end, per `spec.md` section 3's
/// requirement on the `events` batch's column representation.
#[derive(Debug, Serialize, Deserialize)]
struct EventsWire {
    schema: Schema,
    import_timestamp: i64,
    #[serde(with = "serde_bytes")]
    ipc: Vec<u8>,
}

/// One frame exchanged between an [`Egress`] and its paired [`Ingress`].
#[derive(Debug, Serialize, Deserialize)]
enum Frame {
    /// A liveness tick; carries no credit obligation.
    Tick,
    /// A non-empty batch. `element` is the sending side's
    /// [`ElementType::id`]; `payload` is raw bytes for a `bytes` batch or
    /// a JSON-encoded [`EventsWire`] for an `events` batch.
    Batch {
        element: u8,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },
    /// The sender's input is exhausted or it failed; `failure` carries a
    /// diagnostic message if this is an error termination.
    Down { failure: Option<String> },
    /// Acknowledges one `Batch` frame, returning its credit.
    Credit,
}

fn encode_record_batch(batch: &EventsBatch) -> Result<Vec<u8>, arrow::error::ArrowError> {
    let arrow_schema = Arc::new(batch.schema().flattened_arrow_schema());
    let record_batch =
        arrow::record_batch::RecordBatch::try_new(arrow_schema.clone(), batch.columns().to_vec())?;
    let mut buf = Vec::new();
    {
        let mut writer = arrow::ipc::writer::StreamWriter::try_new(&mut buf, &arrow_schema)?;
        writer.write(&record_batch)?;
        writer.finish()?;
    }
    Ok(buf)
}

fn decode_record_batch(
    bytes: &[u8],
) -> Result<Vec<arrow::array::ArrayRef>, arrow::error::ArrowError> {
    let mut reader = arrow::ipc::reader::StreamReader::try_new(std::io::Cursor::new(bytes), None)?;
    let batch = reader
        .next()
        .transpose()?
        .ok_or_else(|| arrow::error::ArrowError::IpcError("empty IPC stream".into()))?;
    Ok(batch.columns().to_vec())
}

fn encode_batch(batch: &AnyBatch) -> Frame {
    match batch {
        AnyBatch::Void(_) => Frame::Tick,
        AnyBatch::Bytes(b) => match b.bytes() {
            None => Frame::Tick,
            Some(data) => Frame::Batch {
                element: ElementType::Bytes.id(),
                payload: data.to_vec(),
            },
        },
        AnyBatch::Events(e) => {
            if e.is_tick() {
                Frame::Tick
            } else {
                let ipc = encode_record_batch(e).expect("an EventsBatch always encodes to valid Arrow IPC");
                let wire = EventsWire {
                    schema: (**e.schema()).clone(),
                    import_timestamp: e.import_timestamp(),
                    ipc,
                };
                Frame::Batch {
                    element: ElementType::Events.id(),
                    payload: serde_json::to_vec(&wire).expect("EventsWire always serializes"),
                }
            }
        }
    }
}

fn decode_batch(frame: Frame) -> Result<AnyBatch, PipelineError> {
    match frame {
        Frame::Tick => Ok(AnyBatch::Void(VoidBatch)),
        Frame::Batch { element, payload } if element == ElementType::Bytes.id() => {
            Ok(AnyBatch::Bytes(BytesBatch::new(Arc::from(payload))))
        }
        Frame::Batch { element, payload } if element == ElementType::Events.id() => {
            let wire: EventsWire = serde_json::from_slice(&payload).map_err(|e| {
                PipelineError::InternalInvariant {
                    message: format!("malformed events wire frame: {e}"),
                }
            })?;
            let columns = decode_record_batch(&wire.ipc).map_err(|e| PipelineError::InternalInvariant {
                message: format!("malformed arrow IPC payload on the bridge: {e}"),
            })?;
            let row_count = columns.first().map_or(0, arrow::array::Array::len);
            let batch =
                EventsBatch::try_new(Arc::new(wire.schema), columns, row_count, wire.import_timestamp)?;
            Ok(AnyBatch::Events(batch))
        }
        Frame::Batch { element, .. } => Err(PipelineError::InternalInvariant {
            message: format!("unknown element type tag {element} on the bridge wire"),
        }),
        Frame::Down { .. } | Frame::Credit => unreachable!("caller handles Down/Credit before decoding"),
    }
}

async fn write_frame(stream: &mut TcpStream, frame: &Frame) -> std::io::Result<()> {
    let payload = serde_json::to_vec(frame).expect("Frame always serializes");
    stream.write_u32(payload.len() as u32).await?;
    stream.write_all(&payload).await?;
    stream.flush().await
}

async fn read_frame(stream: &mut TcpStream) -> std::io::Result<Frame> {
    let len = stream.read_u32().await?;
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    serde_json::from_slice(&buf).map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))
}

/// Allocates a loopback address nobody else is bound to yet, by binding and
/// immediately dropping the listener: the port is free again the instant
/// this function returns, but unused until the caller's own listener binds
/// it shortly after. Used to give an executor-inserted bridge pair an
/// address neither side already knows about.
pub fn allocate_loopback_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("loopback bind always succeeds");
    listener.local_addr().expect("a bound listener always has a local address")
}

async fn connect_with_retry(addr: SocketAddr) -> TcpStream {
    let mut retry_delay = RETRY_INITIAL_TIMEOUT;
    for attempt in 1..=CONNECT_ATTEMPTS {
        match TcpStream::connect(addr).await {
            Ok(stream) => return stream,
            Err(err) => match err.kind() {
                ErrorKind::ConnectionRefused => {
                    debug!("egress: connection to {addr} refused (attempt {attempt}/{CONNECT_ATTEMPTS})");
                }
                _ => warn!("egress: failed to connect to {addr}: {err} (attempt {attempt}/{CONNECT_ATTEMPTS})"),
            },
        }
        sleep(retry_delay).await;
        retry_delay = (retry_delay * 2).min(RETRY_MAX_TIMEOUT);
    }
    panic!("egress: failed to connect to {addr} after {CONNECT_ATTEMPTS} attempts");
}

/// The local half of a bridge pair: pulls batches from its upstream
/// neighbor and writes them over a TCP connection to the paired
/// [`Ingress`]. Always [`Location::MustBeLocal`] and always `detached`,
/// since connecting and writing block the calling OS thread.
#[derive(Debug, Clone)]
pub struct Egress {
    addr: SocketAddr,
}

impl Egress {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

impl Operator for Egress {
    fn name(&self) -> &str {
        "egress"
    }

    fn location(&self) -> Location {
        Location::MustBeLocal
    }

    fn detached(&self) -> bool {
        true
    }

    fn infer_type(&self, _input: ElementType) -> Result<ElementType, PipelineError> {
        // Egress is a local terminus onto the wire: whatever element type
        // it receives, it produces `void` into the rest of the local
        // pipeline (there is nothing further downstream locally).
        Ok(ElementType::Void)
    }

    fn instantiate(&self, input: BatchSeq<AnyBatch>, ctrl: ControlPlane) -> BatchSeq<AnyBatch> {
        let addr = self.addr;
        let runtime = Runtime::new().expect("egress requires a tokio runtime");
        // Connecting is deferred to the first call of the returned
        // sequence rather than done here: the executor starts every node
        // sink-first on the caller's own thread (`spec.md` section 4.6
        // step 4), so connecting eagerly inside `instantiate` would race a
        // paired `Ingress` that hasn't been started yet. Once this node is
        // handed to the scheduler it gets its own dedicated OS thread
        // (`detached`), where blocking here is the documented contract.
        let mut stream: Option<TcpStream> = None;
        let mut input = input;
        let mut done = false;
        Box::new(std::iter::from_fn(move || {
            if done {
                return None;
            }
            let stream = stream.get_or_insert_with(|| {
                let connected = runtime.block_on(connect_with_retry(addr));
                info!("egress connected to {addr}");
                connected
            });
            if ctrl.is_cancelled() {
                let _ = runtime.block_on(write_frame(stream, &Frame::Down { failure: None }));
                done = true;
                return Some(Step::Done);
            }
            match input.next() {
                Some(Step::Batch(batch)) => {
                    let frame = encode_batch(&batch);
                    let result = runtime.block_on(async {
                        write_frame(stream, &frame).await?;
                        // Wait for the ack before sending the next real
                        // batch: this is the credit return the spec
                        // requires (`spec.md` section 5).
                        read_frame(stream).await
                    });
                    if let Err(err) = result {
                        ctrl.emit(Diagnostic::new(
                            Severity::Error,
                            format!("egress write to {addr} failed: {err}"),
                            Span::unknown(),
                        ));
                        done = true;
                        return Some(Step::Done);
                    }
                    Some(Step::Tick(AnyBatch::Void(VoidBatch)))
                }
                Some(Step::Tick(batch)) => {
                    // Ticks carry no credit obligation; send and move on.
                    let frame = encode_batch(&batch);
                    let _ = runtime.block_on(write_frame(stream, &frame));
                    Some(Step::Tick(AnyBatch::Void(VoidBatch)))
                }
                Some(Step::Done) | None => {
                    let _ = runtime.block_on(write_frame(stream, &Frame::Down { failure: None }));
                    done = true;
                    Some(Step::Done)
                }
            }
        }))
    }
}

/// The remote half of a bridge pair: accepts one connection from an
/// [`Egress`], deserializes the frames it receives, and yields them as its
/// output sequence. `produces` is the element type this ingress is known
/// (by the executor, from the wrapped operator's declared type) to
/// deserialize.
#[derive(Debug, Clone)]
pub struct Ingress {
    addr: SocketAddr,
    produces: ElementType,
}

impl Ingress {
    pub fn new(addr: SocketAddr, produces: ElementType) -> Self {
        Self { addr, produces }
    }
}

impl Operator for Ingress {
    fn name(&self) -> &str {
        "ingress"
    }

    fn location(&self) -> Location {
        Location::MustBeRemote
    }

    fn detached(&self) -> bool {
        true
    }

    fn infer_type(&self, input: ElementType) -> Result<ElementType, PipelineError> {
        if input != ElementType::Void {
            return Err(PipelineError::TypeMismatch {
                operator: self.name().into(),
                expected: ElementType::Void.to_string(),
                found: input.to_string(),
                span: Span::unknown(),
            });
        }
        Ok(self.produces)
    }

    fn instantiate(&self, _input: BatchSeq<AnyBatch>, ctrl: ControlPlane) -> BatchSeq<AnyBatch> {
        let addr = self.addr;
        let runtime = Runtime::new().expect("ingress requires a tokio runtime");
        // Binding and accepting are deferred to the first call of the
        // returned sequence for the same reason as `Egress::instantiate`:
        // the executor starts every node sink-first, synchronously, before
        // any node is handed to the scheduler, so blocking here eagerly
        // could stall on a paired `Egress` that hasn't dialed yet.
        let mut conn: Option<(TcpStream, SocketAddr)> = None;
        let mut done = false;
        Box::new(std::iter::from_fn(move || {
            if done {
                return None;
            }
            if conn.is_none() {
                let accepted = runtime.block_on(async {
                    let listener = TcpListener::bind(addr).await?;
                    listener.accept().await
                });
                match accepted {
                    Ok((stream, peer)) => {
                        info!("ingress accepted a connection from {peer}");
                        conn = Some((stream, peer));
                    }
                    Err(err) => {
                        ctrl.emit(Diagnostic::new(
                            Severity::Error,
                            format!("ingress failed to bind/accept on {addr}: {err}"),
                            Span::unknown(),
                        ));
                        done = true;
                        return Some(Step::Done);
                    }
                }
            }
            let (stream, peer) = conn.as_mut().expect("populated just above");
            let peer = *peer;
            if ctrl.is_cancelled() {
                done = true;
                return Some(Step::Done);
            }
            match runtime.block_on(read_frame(stream)) {
                Ok(Frame::Down { failure }) => {
                    done = true;
                    if let Some(message) = failure {
                        ctrl.emit(Diagnostic::new(Severity::Error, message, Span::unknown()));
                    }
                    Some(Step::Done)
                }
                Ok(Frame::Credit) => Some(Step::Tick(AnyBatch::Void(VoidBatch))),
                Ok(frame @ (Frame::Tick | Frame::Batch { .. })) => {
                    let needs_ack = matches!(&frame, Frame::Batch { .. });
                    let decoded = decode_batch(frame);
                    if needs_ack {
                        let _ = runtime.block_on(write_frame(stream, &Frame::Credit));
                    }
                    match decoded {
                        Ok(batch) if batch.is_tick() => Some(Step::Tick(batch)),
                        Ok(batch) => Some(Step::Batch(batch)),
                        Err(err) => {
                            ctrl.emit(Diagnostic::new(Severity::Error, err.to_string(), Span::unknown()));
                            done = true;
                            Some(Step::Done)
                        }
                    }
                }
                Err(err) => {
                    done = true;
                    ctrl.emit(Diagnostic::new(
                        Severity::Error,
                        format!("ingress read from {peer} failed: {err}"),
                        Span::unknown(),
                    ));
                    Some(Step::Done)
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::{events_batch_from_rows, first_row_int64, Scalar};
    use crate::schema::{Field, LeafType};

    fn free_addr() -> SocketAddr {
        allocate_loopback_addr()
    }

    #[test]
    fn events_batch_round_trips_through_the_bridge() {
        let addr = free_addr();
        let schema = Arc::new(Schema::new("t", vec![Field::new("x", LeafType::Int64)]));
        let batch = events_batch_from_rows(
            schema,
            vec![vec![Scalar::Int64(1)], vec![Scalar::Int64(2)]],
            42,
        )
        .unwrap();

        let ingress = Ingress::new(addr, ElementType::Events);
        let ctrl_ingress = crate::test_support::noop_control_plane();
        let ingress_thread = std::thread::spawn(move || {
            let mut out = ingress.instantiate(Box::new(std::iter::empty()), ctrl_ingress);
            match out.next() {
                Some(Step::Batch(AnyBatch::Events(b))) => b,
                other => panic!("expected a decoded events batch, got a different step: {}",
                    matches!(other, Some(Step::Tick(_)))),
            }
        });

        // Give the ingress side a moment to bind and start listening before
        // egress dials it.
        std::thread::sleep(Duration::from_millis(50));

        let egress = Egress::new(addr);
        let ctrl_egress = crate::test_support::noop_control_plane();
        let input: BatchSeq<AnyBatch> = Box::new(
            std::iter::once(Step::Batch(AnyBatch::Events(batch))).chain(std::iter::once(Step::Done)),
        );
        let mut egress_out = egress.instantiate(input, ctrl_egress);
        let _ = egress_out.next(); // drives the write + waits for the ack

        let received = ingress_thread.join().unwrap();
        assert_eq!(received.row_count(), 2);
        assert_eq!(first_row_int64(&received, "x"), Some(1));
        assert_eq!(received.import_timestamp(), 42);
    }
}
