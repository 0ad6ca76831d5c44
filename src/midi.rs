//! MIDI transport seam. The controller only needs to list ports, open one
//! input and one output, send 3-byte messages and get inbound bytes through a
//! callback; `MidirTransport` provides that on top of `midir`.

use crate::error::{PortDirection, TransportError};
use midir::{Ignore, MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};
use tracing::{debug, info};

/// Called on the transport's own thread with `(timestamp_us, bytes)`.
pub type InputCallback = Box<dyn FnMut(u64, &[u8]) + Send + 'static>;

pub trait MidiTransport: Send {
    fn input_ports(&self) -> Result<Vec<String>, TransportError>;
    fn output_ports(&self) -> Result<Vec<String>, TransportError>;
    fn open_input(&mut self, index: usize, callback: InputCallback) -> Result<(), TransportError>;
    fn open_output(&mut self, index: usize) -> Result<(), TransportError>;
    fn send(&mut self, message: &[u8]) -> Result<(), TransportError>;
    /// Closes whatever is open. Closing twice is not an error.
    fn close(&mut self) -> Result<(), TransportError>;
}

pub struct MidirTransport {
    client_name: String,
    input: Option<MidiInput>,
    output: Option<MidiOutput>,
    input_conn: Option<MidiInputConnection<()>>,
    output_conn: Option<MidiOutputConnection>,
}

impl MidirTransport {
    pub fn new(client_name: &str) -> Result<Self, TransportError> {
        let mut input = MidiInput::new(&format!("{}_Input", client_name))?;
        input.ignore(Ignore::None);
        let output = MidiOutput::new(&format!("{}_Output", client_name))?;
        Ok(Self {
            client_name: client_name.to_string(),
            input: Some(input),
            output: Some(output),
            input_conn: None,
            output_conn: None,
        })
    }
}

impl MidiTransport for MidirTransport {
    fn input_ports(&self) -> Result<Vec<String>, TransportError> {
        let input = self
            .input
            .as_ref()
            .ok_or(TransportError::AlreadyOpen(PortDirection::Input))?;
        input
            .ports()
            .iter()
            .map(|p| input.port_name(p).map_err(TransportError::from))
            .collect()
    }

    fn output_ports(&self) -> Result<Vec<String>, TransportError> {
        let output = self
            .output
            .as_ref()
            .ok_or(TransportError::AlreadyOpen(PortDirection::Output))?;
        output
            .ports()
            .iter()
            .map(|p| output.port_name(p).map_err(TransportError::from))
            .collect()
    }

    fn open_input(&mut self, index: usize, mut callback: InputCallback) -> Result<(), TransportError> {
        let input = self
            .input
            .take()
            .ok_or(TransportError::AlreadyOpen(PortDirection::Input))?;
        let ports = input.ports();
        let Some(port) = ports.get(index) else {
            self.input = Some(input);
            return Err(TransportError::InvalidPort {
                direction: PortDirection::Input,
                index,
            });
        };

        let conn_name = format!("{}-in", self.client_name);
        match input.connect(
            port,
            &conn_name,
            move |stamp, message, _| callback(stamp, message),
            (),
        ) {
            Ok(conn) => {
                info!("Opened MIDI input port #{}", index);
                self.input_conn = Some(conn);
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                self.input = Some(e.into_inner());
                Err(TransportError::Port(reason))
            }
        }
    }

    fn open_output(&mut self, index: usize) -> Result<(), TransportError> {
        let output = self
            .output
            .take()
            .ok_or(TransportError::AlreadyOpen(PortDirection::Output))?;
        let ports = output.ports();
        let Some(port) = ports.get(index) else {
            self.output = Some(output);
            return Err(TransportError::InvalidPort {
                direction: PortDirection::Output,
                index,
            });
        };

        let conn_name = format!("{}-out", self.client_name);
        match output.connect(port, &conn_name) {
            Ok(conn) => {
                info!("Opened MIDI output port #{}", index);
                self.output_conn = Some(conn);
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                self.output = Some(e.into_inner());
                Err(TransportError::Port(reason))
            }
        }
    }

    fn send(&mut self, message: &[u8]) -> Result<(), TransportError> {
        let conn = self
            .output_conn
            .as_mut()
            .ok_or(TransportError::NotOpen(PortDirection::Output))?;
        conn.send(message)?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if let Some(conn) = self.input_conn.take() {
            let (input, _) = conn.close();
            self.input = Some(input);
            debug!("Closed MIDI input");
        }
        if let Some(conn) = self.output_conn.take() {
            self.output = Some(conn.close());
            debug!("Closed MIDI output");
        }
        Ok(())
    }
}
