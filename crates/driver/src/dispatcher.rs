//! Command dispatch
//!
//! Decodes an ioctl request, validates it against the command table and runs
//! it on the session. Everything that can be rejected is rejected before the
//! device is touched.

use std::time::Duration;

use common::{BridgeError, UsbTransport};
use nix::errno::Errno;
use protocol::{
    CTRL_BUFF_LENGTH, Command, ControlPacket, DESC_BUFF_LENGTH, DescriptorPacket, Direction,
    InterruptPacket, Opcode, PipePolicyKind, PipePolicyPacket, Reply, SetupPacket, VidPidPacket,
};
use tracing::{debug, warn};

use crate::session::{Interrupt, IoGuard, Session};

/// Timeout of a standard descriptor fetch, independent of the session timeout
pub const DESCRIPTOR_TIMEOUT: Duration = Duration::from_secs(5);

/// Attempts of a standard descriptor fetch
pub const DESCRIPTOR_TRIES: usize = 3;

/// Decode and execute one ioctl request
pub fn dispatch(
    session: &Session,
    interrupt: &Interrupt,
    request: u32,
    payload: &[u8],
) -> Result<Reply, BridgeError> {
    let opcode = Opcode::from_request_code(request).inspect_err(|e| {
        debug!("Rejected request {:#010x}: {}", request, e);
    })?;
    let command = Command::decode(opcode, payload)?;
    command.validate()?;
    execute(session, interrupt, command)
}

/// Execute a validated command
pub fn execute(
    session: &Session,
    interrupt: &Interrupt,
    command: Command,
) -> Result<Reply, BridgeError> {
    let opcode = command.opcode();
    let io = session.begin_io(interrupt)?;
    let timeout = session.timeout();

    let result = match command {
        Command::SendControl(packet) | Command::ReceiveControl(packet) => {
            control(&io, &packet, timeout)
        }
        Command::GetDescriptor(packet) => descriptor(&io, &packet),
        Command::SetPipePolicy(policy) => set_pipe_policy(session, policy),
        Command::GetVendorProductId => Ok(Reply::Ids(VidPidPacket {
            vendor_id: session.vendor_id(),
            product_id: session.product_id(),
        })),
        Command::IsConnected => Ok(Reply::Connected),
        Command::WriteInterrupt(packet) => interrupt_write(&io, &packet, timeout),
    };

    match &result {
        Ok(reply) => debug!(
            "Session {}: {} -> {}",
            session.minor(),
            opcode,
            reply.return_value()
        ),
        Err(e) => warn!("Session {}: {} failed: {}", session.minor(), opcode, e),
    }
    result
}

fn control(
    io: &IoGuard<'_>,
    packet: &ControlPacket,
    timeout: Duration,
) -> Result<Reply, BridgeError> {
    let len = packet.declared_len();
    let setup = packet.setup;
    match setup.direction() {
        Direction::Out => {
            let mut data = packet.data;
            let sent = io
                .transport()
                .control(&setup, &mut data[..len], timeout)
                .map_err(BridgeError::Transport)?;
            Ok(Reply::Sent(sent))
        }
        Direction::In => {
            let mut data = [0u8; CTRL_BUFF_LENGTH];
            let received = io
                .transport()
                .control(&setup, &mut data[..len], timeout)
                .map_err(BridgeError::Transport)?;
            Ok(Reply::Received(data[..received.min(len)].to_vec()))
        }
    }
}

fn descriptor(io: &IoGuard<'_>, packet: &DescriptorPacket) -> Result<Reply, BridgeError> {
    // the type is a C enum on the wire; only its low byte reaches the bus
    let descriptor_type = (packet.descriptor_type & 0xFF) as u8;
    let data = fetch_descriptor(io.transport(), descriptor_type, packet.index)
        .map_err(BridgeError::Transport)?;
    Ok(Reply::Descriptor(data))
}

/// Standard GET_DESCRIPTOR with retries
///
/// An empty result or an error other than a timeout is retried, as is a
/// reply whose type byte differs from the request (`ENODATA`). The result of
/// the last attempt is returned, clipped to the inline buffer.
pub fn fetch_descriptor(
    transport: &dyn UsbTransport,
    descriptor_type: u8,
    index: u8,
) -> Result<Vec<u8>, Errno> {
    let setup = SetupPacket::get_descriptor(descriptor_type, index, DESC_BUFF_LENGTH as u16);
    let mut buf = [0u8; DESC_BUFF_LENGTH];
    let mut result = Ok(0);

    for attempt in 1..=DESCRIPTOR_TRIES {
        buf.fill(0);
        result = transport.control(&setup, &mut buf, DESCRIPTOR_TIMEOUT);
        match result {
            Ok(0) => {}
            Err(Errno::ETIMEDOUT) => break,
            Err(_) => {}
            Ok(len) if len > 1 && buf[1] != descriptor_type => {
                result = Err(Errno::ENODATA);
            }
            Ok(_) => break,
        }
        debug!(
            "Descriptor {:#04x}/{} attempt {} failed: {:?}",
            descriptor_type, index, attempt, result
        );
    }

    result.map(|len| buf[..len.min(DESC_BUFF_LENGTH)].to_vec())
}

fn set_pipe_policy(session: &Session, policy: PipePolicyPacket) -> Result<Reply, BridgeError> {
    match PipePolicyKind::try_from(policy.policy_type)? {
        PipePolicyKind::ShortPacketTerminate => {}
        PipePolicyKind::TransferTimeout => session.set_timeout(policy.value),
    }
    Ok(Reply::PolicySet)
}

fn interrupt_write(
    io: &IoGuard<'_>,
    packet: &InterruptPacket,
    timeout: Duration,
) -> Result<Reply, BridgeError> {
    let sent = io
        .transport()
        .interrupt_out(packet.payload(), timeout)
        .map_err(BridgeError::Transport)?;
    Ok(Reply::InterruptSent(sent))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionRef;
    use common::test_utils::{MockRecorder, MockResponse, MockTransport, TransferKind};
    use protocol::{DescriptorType, WirePacket};

    fn attach() -> (SessionRef, MockRecorder) {
        let transport = MockTransport::new(0x1209, 0x0002);
        let recorder = transport.recorder();
        (Session::attach(0, Box::new(transport)), recorder)
    }

    #[test]
    fn test_unknown_opcode_never_touches_device() {
        let (session, recorder) = attach();
        let code = nix::request_code_write!(b'M', 4, 8) as u32;

        let result = dispatch(&session, &Interrupt::new(), code, &[0; 8]);

        assert_eq!(result, Err(BridgeError::UnsupportedOperation));
        assert!(recorder.submissions().is_empty());
    }

    #[test]
    fn test_payload_size_mismatch() {
        let (session, recorder) = attach();
        let code = Opcode::SetPipePolicy.request_code();

        let result = dispatch(&session, &Interrupt::new(), code, &[0; 4]);

        assert_eq!(result, Err(BridgeError::InvalidArgument));
        assert!(recorder.submissions().is_empty());
    }

    #[test]
    fn test_oversized_control_rejected_before_transfer() {
        let (session, recorder) = attach();
        let packet = ControlPacket::new(SetupPacket {
            request_type: 0xC0,
            length: 129,
            ..Default::default()
        });

        let result = dispatch(
            &session,
            &Interrupt::new(),
            Opcode::ReceiveControl.request_code(),
            &packet.to_bytes(),
        );

        assert_eq!(result, Err(BridgeError::BufferTooLarge));
        assert!(recorder.submissions().is_empty());
    }

    #[test]
    fn test_send_control_with_in_direction_rejected() {
        let (session, recorder) = attach();
        let packet = ControlPacket::new(SetupPacket {
            request_type: 0xC0,
            request: 0x01,
            length: 16,
            ..Default::default()
        });

        let result = dispatch(
            &session,
            &Interrupt::new(),
            Opcode::SendControl.request_code(),
            &packet.to_bytes(),
        );

        assert_eq!(result, Err(BridgeError::InvalidArgument));
        assert!(recorder.submissions().is_empty());
    }

    #[test]
    fn test_control_in_clips_to_declared_length() {
        let (session, recorder) = attach();
        recorder.push_response(MockResponse::Data(vec![0xAB; 40]));
        let packet = ControlPacket::new(SetupPacket {
            request_type: 0xC0,
            request: 0x01,
            length: 16,
            ..Default::default()
        });

        let reply = execute(
            &session,
            &Interrupt::new(),
            Command::ReceiveControl(packet),
        )
        .unwrap();

        assert_eq!(reply, Reply::Received(vec![0xAB; 16]));
        assert_eq!(recorder.last().unwrap().len, 16);
    }

    #[test]
    fn test_control_out_sends_declared_bytes() {
        let (session, recorder) = attach();
        let setup = SetupPacket {
            request_type: 0x40,
            request: 0x09,
            length: 3,
            ..Default::default()
        };
        let packet = ControlPacket::with_data(setup, &[1, 2, 3]).unwrap();

        let reply = execute(&session, &Interrupt::new(), Command::SendControl(packet)).unwrap();

        assert_eq!(reply, Reply::Sent(3));
        assert_eq!(recorder.last().unwrap().data, vec![1, 2, 3]);
    }

    #[test]
    fn test_transport_error_passes_through() {
        let (session, recorder) = attach();
        recorder.push_response(MockResponse::Error(Errno::EPIPE));
        let packet = ControlPacket::new(SetupPacket {
            request_type: 0x80,
            length: 8,
            ..Default::default()
        });

        let result = execute(&session, &Interrupt::new(), Command::ReceiveControl(packet));
        assert_eq!(result, Err(BridgeError::Transport(Errno::EPIPE)));
    }

    #[test]
    fn test_descriptor_retries_then_succeeds() {
        let (session, recorder) = attach();
        recorder.push_response(MockResponse::Error(Errno::EPIPE));
        // wrong type byte
        recorder.push_response(MockResponse::Data(vec![9, 2, 0, 0]));
        recorder.push_response(MockResponse::Data(common::test_utils::create_mock_device_descriptor(2)));

        let packet = DescriptorPacket::new(DescriptorType::Device as u8, 0);
        let reply = execute(&session, &Interrupt::new(), Command::GetDescriptor(packet)).unwrap();

        let Reply::Descriptor(data) = reply else {
            panic!("expected descriptor reply");
        };
        assert_eq!(data.len(), 18);
        assert_eq!(recorder.count(TransferKind::Control), 3);
        let last = recorder.last().unwrap();
        assert_eq!(last.timeout, DESCRIPTOR_TIMEOUT);
        assert_eq!(last.setup.unwrap().value, 0x0100);
    }

    #[test]
    fn test_descriptor_timeout_is_not_retried() {
        let (session, recorder) = attach();
        recorder.push_response(MockResponse::Error(Errno::ETIMEDOUT));

        let packet = DescriptorPacket::new(DescriptorType::Device as u8, 0);
        let result = execute(&session, &Interrupt::new(), Command::GetDescriptor(packet));

        assert_eq!(result, Err(BridgeError::Transport(Errno::ETIMEDOUT)));
        assert_eq!(recorder.count(TransferKind::Control), 1);
    }

    #[test]
    fn test_descriptor_wrong_type_exhausts_retries() {
        let (session, recorder) = attach();
        for _ in 0..DESCRIPTOR_TRIES {
            recorder.push_response(MockResponse::Data(vec![9, 2, 0, 0]));
        }

        let packet = DescriptorPacket::new(DescriptorType::Device as u8, 0);
        let result = execute(&session, &Interrupt::new(), Command::GetDescriptor(packet));

        assert_eq!(result, Err(BridgeError::Transport(Errno::ENODATA)));
        assert_eq!(recorder.count(TransferKind::Control), DESCRIPTOR_TRIES);
    }

    #[test]
    fn test_pipe_policy() {
        let (session, recorder) = attach();
        let interrupt = Interrupt::new();

        let timeout = PipePolicyPacket {
            policy_type: PipePolicyKind::TransferTimeout as u32,
            value: 500,
        };
        let reply = execute(&session, &interrupt, Command::SetPipePolicy(timeout)).unwrap();
        assert_eq!(reply, Reply::PolicySet);
        assert_eq!(session.timeout(), Duration::from_millis(500));

        let short_packet = PipePolicyPacket {
            policy_type: PipePolicyKind::ShortPacketTerminate as u32,
            value: 1,
        };
        assert!(execute(&session, &interrupt, Command::SetPipePolicy(short_packet)).is_ok());
        assert_eq!(session.timeout(), Duration::from_millis(500));

        let unknown = PipePolicyPacket {
            policy_type: 7,
            value: 1,
        };
        assert_eq!(
            execute(&session, &interrupt, Command::SetPipePolicy(unknown)),
            Err(BridgeError::InvalidArgument)
        );
        assert!(recorder.submissions().is_empty());
    }

    #[test]
    fn test_ids_and_connectivity() {
        let (session, _recorder) = attach();
        let interrupt = Interrupt::new();

        let reply = execute(&session, &interrupt, Command::GetVendorProductId).unwrap();
        assert_eq!(
            reply,
            Reply::Ids(VidPidPacket {
                vendor_id: 0x1209,
                product_id: 0x0002
            })
        );
        assert_eq!(
            execute(&session, &interrupt, Command::IsConnected),
            Ok(Reply::Connected)
        );

        session.mark_disconnected();
        assert_eq!(
            execute(&session, &interrupt, Command::IsConnected),
            Err(BridgeError::NoDevice)
        );
    }

    #[test]
    fn test_interrupt_write_uses_session_timeout() {
        let (session, recorder) = attach();
        session.set_timeout(250);
        let packet = InterruptPacket::with_data(&[5; 12]).unwrap();

        let reply = execute(&session, &Interrupt::new(), Command::WriteInterrupt(packet)).unwrap();

        assert_eq!(reply, Reply::InterruptSent(12));
        let last = recorder.last().unwrap();
        assert_eq!(last.kind, TransferKind::InterruptOut);
        assert_eq!(last.timeout, Duration::from_millis(250));
    }
}
