//! Inbound side of a link: decodes frames, answers requests, stores received values and
//! files, and drives the close handshake.

use std::io::Read;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex};

use tracing::{debug, error, info, warn};

use crate::event::{Event, EventKind};
use crate::file_transfer::{self, IncomingFile};
use crate::link::VirtualLink;
use crate::protocol::{Command, Frame, Opcode};
use crate::wait::lock;
use crate::wire::{self, DecodeError};

const DEGREE_RANGE: RangeInclusive<f32> = 0.0..=360.0;
const LIGHT_RANGE: RangeInclusive<f32> = 0.0..=100.0;

#[derive(Debug, Default)]
struct RemoteValues {
    degree: Option<f32>,
    light: Option<f32>,
    file: Option<String>,
}

/// Why a frame could not be handled.
enum Fault {
    /// The stream ended or failed.
    Stream(DecodeError),
    /// Framing is lost; nothing after this can be trusted.
    Desync(String),
    /// A well-formed frame that does not fit the current state.
    Unexpected(String),
}

impl From<DecodeError> for Fault {
    fn from(e: DecodeError) -> Self {
        match e {
            DecodeError::UnknownOpcode(_) | DecodeError::TooLarge(_) => Fault::Desync(e.to_string()),
            e => Fault::Stream(e),
        }
    }
}

pub(crate) struct MessageReader {
    values: Mutex<RemoteValues>,
    incoming: Mutex<Option<IncomingFile>>,
}

impl MessageReader {
    pub(crate) fn new() -> Self {
        Self {
            values: Mutex::new(RemoteValues::default()),
            incoming: Mutex::new(None),
        }
    }

    pub(crate) fn remote_degree(&self) -> Option<f32> {
        lock(&self.values).degree
    }

    pub(crate) fn remote_light_value(&self) -> Option<f32> {
        lock(&self.values).light
    }

    pub(crate) fn remote_file_name(&self) -> Option<String> {
        lock(&self.values).file.clone()
    }

    pub(crate) fn is_receiving_file(&self) -> bool {
        lock(&self.incoming).is_some()
    }

    /// Reader thread body of a direct link.
    pub(crate) fn run(link: Arc<VirtualLink>, mut src: Box<dyn Read + Send>) {
        debug!(link = %link, "reader started");
        loop {
            match wire::read_u8_or_eof(&mut src) {
                Ok(Some(code)) => link.reader().handle(&link, code, &mut src),
                Ok(None) => link.close_connection("peer closed the stream"),
                Err(e) => link.close_connection(&format!("read failed: {e}")),
            }
            if link.is_terminated() {
                break;
            }
        }
        link.reader().salvage(&link);
        debug!(link = %link, "reader finished");
    }

    /// Handle one frame whose opcode byte has been read.
    pub(crate) fn handle(&self, link: &VirtualLink, code: u8, src: &mut dyn Read) {
        match self.dispatch(link, code, src) {
            Ok(()) => {}
            Err(Fault::Stream(e)) if e.is_end_of_stream() => {
                link.close_connection("peer ended the stream");
            }
            Err(Fault::Stream(e)) => {
                error!(link = %link, error = %e, "read failed");
                link.close_connection(&format!("read failed: {e}"));
            }
            Err(Fault::Desync(msg)) => {
                error!(link = %link, "{msg}, closing");
                link.close_connection(&msg);
            }
            Err(Fault::Unexpected(msg)) => {
                warn!(link = %link, "unexpected response: {msg}");
                let (requested, acknowledged) = link.close_flags();
                if requested || acknowledged {
                    link.close_connection("unexpected response during close");
                }
            }
        }
    }

    fn dispatch(&self, link: &VirtualLink, code: u8, src: &mut dyn Read) -> Result<(), Fault> {
        let op = Opcode::from_byte(code).map_err(|e| Fault::Desync(e.to_string()))?;
        if link.config().log_traffic {
            debug!(link = %link, ?op, "frame received");
        }
        match op {
            Opcode::RequestDegree => link.answer(Frame::Degree(link.providers().degree_or_sentinel())),
            Opcode::RequestLight => link.answer(Frame::Light(link.providers().light_or_sentinel())),
            Opcode::RequestFile => {
                let name = wire::read_string(src)?;
                link.answer_file_request(&name);
            }
            Opcode::SendDegree => {
                let v = wire::read_f32(src)?;
                self.accept_value(link, EventKind::Degree, v);
            }
            Opcode::SendLight => {
                let v = wire::read_f32(src)?;
                self.accept_value(link, EventKind::Light, v);
            }
            Opcode::SendFileEmpty => self.file_received(link, String::new()),
            Opcode::SendFileWhole => self.read_whole_file(link, src)?,
            Opcode::SendFilePart => self.read_file_part(link, src)?,
            Opcode::Close | Opcode::CloseAck | Opcode::CloseDecline => self.on_command(link, op)?,
        }
        Ok(())
    }

    fn accept_value(&self, link: &VirtualLink, kind: EventKind, value: f32) {
        let (range, event) = match kind {
            EventKind::Degree => (DEGREE_RANGE, Event::Degree(value)),
            _ => (LIGHT_RANGE, Event::Light(value)),
        };
        if !range.contains(&value) {
            warn!(link = %link, ?kind, value, "value out of range, ignored");
            link.notify(&Event::Rejected { kind, value });
            return;
        }
        {
            let mut values = lock(&self.values);
            match kind {
                EventKind::Degree => values.degree = Some(value),
                _ => values.light = Some(value),
            }
        }
        link.notify(&event);
    }

    fn file_received(&self, link: &VirtualLink, stored: String) {
        lock(&self.values).file = Some(stored.clone());
        if stored.is_empty() {
            info!(link = %link, "peer had no file");
        } else {
            info!(link = %link, path = %stored, "file received");
        }
        link.notify(&Event::File(stored));
    }

    fn read_whole_file(&self, link: &VirtualLink, src: &mut dyn Read) -> Result<(), Fault> {
        let name = wire::read_string(src)?;
        if name.is_empty() {
            self.file_received(link, String::new());
            return Ok(());
        }
        let path = link.localize(&name);
        let len = wire::checked_len(wire::read_i32(src)?)?;
        let stored = file_transfer::receive_to_file(
            src,
            path.as_deref(),
            len,
            link.config().read_chunk_size,
        )?;
        let stored = match path {
            Some(p) if stored => p.display().to_string(),
            _ => {
                warn!(link = %link, file = %name, "file could not be stored");
                String::new()
            }
        };
        self.file_received(link, stored);
        Ok(())
    }

    fn read_file_part(&self, link: &VirtualLink, src: &mut dyn Read) -> Result<(), Fault> {
        let total = wire::read_i32(src)?;
        if total <= 0 {
            return Err(Fault::Desync(format!("file part count {total}")));
        }
        let part_name = wire::read_string(src)?;
        let mut incoming = lock(&self.incoming);
        let index = match incoming.as_mut() {
            Some(file) => {
                file.announce(total);
                file.next_index()
            }
            None => 0,
        };
        let base_name = match part_name.strip_suffix(index.to_string().as_str()) {
            Some(b) if !b.is_empty() => b.to_string(),
            _ => {
                return Err(Fault::Desync(format!(
                    "file part {part_name} out of order, expected index {index}"
                )))
            }
        };
        let file = incoming.get_or_insert_with(|| {
            let path = link.localize(&base_name);
            IncomingFile::begin(base_name.clone(), path, total)
        });
        if file.base_name() != base_name {
            return Err(Fault::Desync(format!(
                "file part {part_name} does not belong to {}",
                file.base_name()
            )));
        }
        let path = file.part_path(index);
        let len = wire::checked_len(wire::read_i32(src)?)?;
        file_transfer::receive_to_file(src, path.as_deref(), len, link.config().read_chunk_size)?;
        debug!(link = %link, part = %part_name, index, total, "file part received");
        if !file.record_part() {
            return Ok(());
        }
        let finished = incoming.take();
        drop(incoming);
        let stored = finished
            .and_then(IncomingFile::finish)
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        self.file_received(link, stored);
        Ok(())
    }

    fn on_command(&self, link: &VirtualLink, op: Opcode) -> Result<(), Fault> {
        match op {
            Opcode::Close => {
                if self.is_receiving_file() {
                    info!(link = %link, "close requested during file transfer, declining");
                    if let Err(e) = link.send(&Frame::Command(Command::CloseDecline), false) {
                        warn!(link = %link, error = %e, "cannot decline close");
                    }
                    return Ok(());
                }
                let (requested, acknowledged) = link.close_flags();
                if acknowledged {
                    link.close_connection("close received after close ACK");
                    return Ok(());
                }
                if requested {
                    // Both sides asked at once; answer theirs and drop ours.
                    link.abandon_close_request();
                }
                match link.send(&Frame::Command(Command::CloseAck), true) {
                    Ok(()) => {
                        link.mark_close_acknowledged();
                        link.close_connection("close requested by peer");
                    }
                    Err(e) => warn!(link = %link, error = %e, "cannot acknowledge close"),
                }
                Ok(())
            }
            Opcode::CloseAck => {
                let (requested, _) = link.close_flags();
                if !requested {
                    warn!(link = %link, "close ACK without close request");
                }
                link.close_connection("close acknowledged by peer");
                Ok(())
            }
            Opcode::CloseDecline => {
                let (requested, _) = link.close_flags();
                if !requested {
                    return Err(Fault::Unexpected("close decline without close request".into()));
                }
                link.abandon_close_request();
                info!(link = %link, "peer declined close");
                link.notify(&Event::CloseDeclined);
                Ok(())
            }
            other => Err(Fault::Unexpected(format!("{other:?} is not a command"))),
        }
    }

    /// Keep whatever parts arrived before the stream ended.
    pub(crate) fn salvage(&self, link: &VirtualLink) {
        let Some(file) = lock(&self.incoming).take() else {
            return;
        };
        warn!(
            link = %link,
            file = %file.base_name(),
            missing = file.remaining(),
            "stream ended during file transfer, keeping received parts"
        );
        let stored = file
            .salvage()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        self.file_received(link, stored);
    }
}
