//! Routed envelopes: `from | to | code [| len | payload]` over a shared physical link.

use std::io::{self, Read};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{debug, warn};

use crate::error::LinkError;
use crate::protocol::RouteCode;
use crate::wait::lock;
use crate::wire::{self, DecodeError};
use crate::writer::OutputPump;

/// One decoded envelope. `payload` is empty unless `code` is [`RouteCode::Data`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedFrame {
    pub from: String,
    pub to: String,
    pub code: RouteCode,
    pub payload: Vec<u8>,
}

pub fn encode_data(from: &str, to: &str, payload: &[u8]) -> Vec<u8> {
    wire::concat(&[
        &wire::encode_str(from),
        &wire::encode_str(to),
        &[RouteCode::Data.to_byte()],
        &wire::encode_i32(payload.len() as i32),
        payload,
    ])
}

pub fn encode_control(from: &str, to: &str, code: RouteCode) -> Vec<u8> {
    wire::concat(&[
        &wire::encode_str(from),
        &wire::encode_str(to),
        &[code.to_byte()],
    ])
}

pub fn encode_routed(frame: &RoutedFrame) -> Vec<u8> {
    match frame.code {
        RouteCode::Data => encode_data(&frame.from, &frame.to, &frame.payload),
        code => encode_control(&frame.from, &frame.to, code),
    }
}

/// Read one envelope, or `None` at a clean end of stream.
pub fn read_routed<R: Read + ?Sized>(src: &mut R) -> Result<Option<RoutedFrame>, DecodeError> {
    let Some(from_len) = wire::read_i32_or_eof(src)? else {
        return Ok(None);
    };
    let from = wire::read_string_body(src, from_len)?;
    let to = wire::read_string(src)?;
    let code = wire::read_u8_or_eof(src)?.ok_or(DecodeError::EndOfStream)?;
    let code = RouteCode::from_byte(code)?;
    let payload = if code == RouteCode::Data {
        let len = wire::checked_len(wire::read_i32(src)?)?;
        wire::read_bytes(src, len)?
    } else {
        Vec::new()
    };
    Ok(Some(RoutedFrame {
        from,
        to,
        code,
        payload,
    }))
}

/// Outbound side of a routed link: wraps frames in data envelopes on the shared uplink.
///
/// The uplink queue is shared, so a close request blocks only this link.
pub(crate) struct RoutedOutbound {
    from: String,
    to: String,
    uplink: Arc<OutputPump>,
    blocked: Mutex<bool>,
}

impl RoutedOutbound {
    pub(crate) fn new(from: &str, to: &str, uplink: Arc<OutputPump>) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            uplink,
            blocked: Mutex::new(false),
        }
    }

    pub(crate) fn write(&self, frame: Vec<u8>, block_after: bool) -> Result<(), LinkError> {
        let mut blocked = lock(&self.blocked);
        if *blocked {
            return Err(LinkError::QueueBlocked);
        }
        self.uplink
            .write(encode_data(&self.from, &self.to, &frame), false)?;
        if block_after {
            *blocked = true;
        }
        Ok(())
    }

    pub(crate) fn deblock(&self) {
        *lock(&self.blocked) = false;
    }

    pub(crate) fn uplink(&self) -> &OutputPump {
        &self.uplink
    }
}

/// Receives the envelopes read from one physical link.
pub trait RouteHandler: Send + Sync {
    fn on_frame(&self, frame: RoutedFrame) -> Result<(), LinkError>;

    /// The physical link is gone. Called once, from the reader thread.
    fn on_link_lost(&self, reason: &str);
}

/// Read envelopes until the physical link closes.
pub fn run_routing_reader<R: Read + ?Sized>(src: &mut R, handler: &dyn RouteHandler) {
    let reason = loop {
        match read_routed(src) {
            Ok(Some(frame)) => {
                let (from, to, code) = (frame.from.clone(), frame.to.clone(), frame.code);
                if let Err(e) = handler.on_frame(frame) {
                    warn!(%from, %to, ?code, error = %e, "routed frame not handled");
                }
            }
            Ok(None) => break "peer closed the stream".to_string(),
            Err(e) if e.is_end_of_stream() => break "peer ended the stream".to_string(),
            Err(e) => break format!("read failed: {e}"),
        }
    };
    debug!(%reason, "routing reader finished");
    handler.on_link_lost(&reason);
}

/// Start a routing reader thread.
pub(crate) fn spawn_routing_reader<H>(
    name: String,
    mut src: Box<dyn Read + Send>,
    handler: Arc<H>,
) -> io::Result<()>
where
    H: RouteHandler + 'static,
{
    thread::Builder::new()
        .name(format!("comlink-route-{name}"))
        .spawn(move || run_routing_reader(&mut src, handler.as_ref()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn data_envelope_layout() {
        let bytes = encode_data("A", "B", &[0x10, 1, 2, 3, 4]);
        assert_eq!(
            bytes,
            vec![0, 0, 0, 1, b'A', 0, 0, 0, 1, b'B', 0x00, 0, 0, 0, 5, 0x10, 1, 2, 3, 4]
        );
    }

    #[test]
    fn control_envelope_has_no_length() {
        let bytes = encode_control("B", "A", RouteCode::ReceiverNotKnown);
        assert_eq!(bytes, vec![0, 0, 0, 1, b'B', 0, 0, 0, 1, b'A', 0x13]);
    }

    #[test]
    fn reads_mixed_envelopes() {
        let mut buf = encode_control("NXT1", "PC", RouteCode::ConnectRequest);
        buf.extend(encode_data("NXT1", "NXT2", b"\x00"));
        let mut src = Cursor::new(buf);
        let first = read_routed(&mut src).unwrap().unwrap();
        assert_eq!(first.code, RouteCode::ConnectRequest);
        assert!(first.payload.is_empty());
        let second = read_routed(&mut src).unwrap().unwrap();
        assert_eq!(second.to, "NXT2");
        assert_eq!(second.payload, vec![0x00]);
        assert!(read_routed(&mut src).unwrap().is_none());
    }

    #[test]
    fn unknown_route_code_is_an_error() {
        let mut buf = wire::encode_str("A");
        buf.extend(wire::encode_str("B"));
        buf.push(0x30);
        assert!(matches!(
            read_routed(&mut Cursor::new(buf)),
            Err(DecodeError::UnknownOpcode(_))
        ));
    }

    struct Recorder {
        frames: Mutex<Vec<RoutedFrame>>,
        lost: Mutex<Option<String>>,
    }

    impl RouteHandler for Recorder {
        fn on_frame(&self, frame: RoutedFrame) -> Result<(), LinkError> {
            self.frames.lock().unwrap().push(frame);
            Ok(())
        }
        fn on_link_lost(&self, reason: &str) {
            *self.lost.lock().unwrap() = Some(reason.to_string());
        }
    }

    #[test]
    fn reader_reports_frames_then_loss() {
        let frame = RoutedFrame {
            from: "A".into(),
            to: "B".into(),
            code: RouteCode::Data,
            payload: vec![0x15, 0, 0, 0, 0],
        };
        let rec = Recorder {
            frames: Mutex::new(Vec::new()),
            lost: Mutex::new(None),
        };
        run_routing_reader(&mut Cursor::new(encode_routed(&frame)), &rec);
        assert_eq!(*rec.frames.lock().unwrap(), vec![frame]);
        assert_eq!(rec.lost.lock().unwrap().as_deref(), Some("peer closed the stream"));
    }
}
