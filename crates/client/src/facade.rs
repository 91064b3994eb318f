//! WinUSB-style call surface
//!
//! [`WinUsbDevice`] turns WinUSB calls into channel operations: bulk pipes
//! map to raw read/write, everything else to a command packet on ioctl.
//!
//! Two return conventions are exposed, as the emulated API does. Transfer
//! calls return `bool` and keep the cause for [`WinUsbDevice::last_error`];
//! their `try_*` twins return the cause directly. Descriptor queries and
//! [`WinUsbDevice::connect`] hand the errno back unchanged.

use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, NativeEndian};
use common::BridgeError;
use protocol::{
    BULK_BUFF_LENGTH, CTRL_BUFF_LENGTH, Channel, ControlPacket, DESC_BUFF_LENGTH,
    DescriptorPacket, DescriptorType, DeviceDescriptor, Direction, Errno, INT_BUFF_LENGTH,
    InterruptPacket, NodeOpener, Opcode, PipePolicyKind, PipePolicyPacket, SetupPacket,
    VidPidPacket, WirePacket, node_path,
};
use tracing::{debug, trace};

/// An open WixUSB device
#[derive(Debug)]
pub struct WinUsbDevice<C: Channel> {
    channel: C,
    path: PathBuf,
    last_error: Option<BridgeError>,
}

impl<C: Channel> WinUsbDevice<C> {
    /// Open the first node of `prefix0 .. prefix{candidates-1}` that opens
    ///
    /// Fails with the errno of the last attempt (`ENOENT` when there were no
    /// candidates).
    pub fn connect<O>(opener: &O, prefix: &str, candidates: u32) -> Result<Self, Errno>
    where
        O: NodeOpener<Node = C>,
    {
        let mut last = Errno::ENOENT;
        for index in 0..candidates {
            let path = node_path(prefix, index);
            match opener.open(&path) {
                Ok(channel) => {
                    debug!("Connected to {}", path.display());
                    return Ok(Self::from_channel(channel, path));
                }
                Err(errno) => {
                    trace!("{}: {}", path.display(), errno);
                    last = errno;
                }
            }
        }
        debug!("No device node under {} ({})", prefix, last);
        Err(last)
    }

    /// Wrap an already open channel
    pub fn from_channel(channel: C, path: impl Into<PathBuf>) -> Self {
        Self {
            channel,
            path: path.into(),
            last_error: None,
        }
    }

    /// Node this device was opened from
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cause of the most recent failed call
    pub fn last_error(&self) -> Option<BridgeError> {
        self.last_error
    }

    pub fn into_inner(self) -> C {
        self.channel
    }

    /// `WinUsb_ControlTransfer`
    ///
    /// IN transfers fill `buffer`; OUT transfers send it. The setup length is
    /// at most 128 bytes: an IN buffer must hold it, an OUT buffer must match
    /// it exactly. The reported count never exceeds the setup length.
    pub fn control_transfer(
        &mut self,
        setup: SetupPacket,
        buffer: &mut [u8],
        length_transferred: Option<&mut usize>,
    ) -> bool {
        let result = self.try_control_transfer(setup, buffer);
        self.complete(result, length_transferred)
    }

    pub fn try_control_transfer(
        &mut self,
        setup: SetupPacket,
        buffer: &mut [u8],
    ) -> Result<usize, BridgeError> {
        let declared = usize::from(setup.length);
        if declared > CTRL_BUFF_LENGTH {
            return Err(BridgeError::BufferTooLarge);
        }

        match setup.direction() {
            Direction::In => {
                if buffer.len() < declared {
                    return Err(BridgeError::InvalidArgument);
                }
                let mut arg = ControlPacket::new(setup).to_bytes();
                let received = self.command(Opcode::ReceiveControl, &mut arg)?;
                let data = ControlPacket::reply_data(&arg, received.min(declared))?;
                buffer[..data.len()].copy_from_slice(data);
                Ok(data.len())
            }
            Direction::Out => {
                if buffer.len() != declared {
                    return Err(BridgeError::InvalidArgument);
                }
                let mut arg = ControlPacket::with_data(setup, buffer)?.to_bytes();
                self.command(Opcode::SendControl, &mut arg)
            }
        }
    }

    /// `WinUsb_ReadPipe`
    ///
    /// The device has one bulk IN pipe, so `pipe_id` only shows up in traces.
    pub fn read_pipe(
        &mut self,
        pipe_id: u8,
        buffer: &mut [u8],
        length_transferred: Option<&mut usize>,
    ) -> bool {
        let result = self.try_read_pipe(pipe_id, buffer);
        self.complete(result, length_transferred)
    }

    pub fn try_read_pipe(&mut self, pipe_id: u8, buffer: &mut [u8]) -> Result<usize, BridgeError> {
        if buffer.len() > BULK_BUFF_LENGTH {
            return Err(BridgeError::BufferTooLarge);
        }
        trace!("Pipe {:#04x}: read {} bytes", pipe_id, buffer.len());
        Ok(self.channel.read(buffer)?)
    }

    /// `WinUsb_WritePipe`
    pub fn write_pipe(
        &mut self,
        pipe_id: u8,
        buffer: &[u8],
        length_transferred: Option<&mut usize>,
    ) -> bool {
        let result = self.try_write_pipe(pipe_id, buffer);
        self.complete(result, length_transferred)
    }

    pub fn try_write_pipe(&mut self, pipe_id: u8, buffer: &[u8]) -> Result<usize, BridgeError> {
        if buffer.len() > BULK_BUFF_LENGTH {
            return Err(BridgeError::BufferTooLarge);
        }
        trace!("Pipe {:#04x}: write {} bytes", pipe_id, buffer.len());
        Ok(self.channel.write(buffer)?)
    }

    /// `WinUsb_GetDescriptor`
    ///
    /// Returns the number of bytes copied into `buffer`. A descriptor longer
    /// than `buffer` is cut short without error. The channel carries no
    /// language id; string descriptors come back in the device default.
    pub fn get_descriptor(
        &mut self,
        descriptor_type: u8,
        index: u8,
        language_id: u16,
        buffer: &mut [u8],
    ) -> Result<usize, Errno> {
        trace!(
            "Descriptor {:#04x}/{} (language {:#06x})",
            descriptor_type, index, language_id
        );

        let mut arg = DescriptorPacket::new(descriptor_type, index).to_bytes();
        let fetched = self
            .command(Opcode::GetDescriptor, &mut arg)
            .map_err(Errno::from)?;

        let copied = fetched.min(buffer.len()).min(DESC_BUFF_LENGTH);
        let data = DescriptorPacket::reply_data(&arg, copied)
            .map_err(|e| Errno::from(BridgeError::from(e)))?;
        buffer[..copied].copy_from_slice(data);
        Ok(copied)
    }

    /// Standard device descriptor of the bound function
    pub fn device_descriptor(&mut self) -> Result<DeviceDescriptor, BridgeError> {
        let mut raw = [0u8; DeviceDescriptor::SIZE];
        let len = self.get_descriptor(DescriptorType::Device as u8, 0, 0, &mut raw)?;
        Ok(DeviceDescriptor::parse(&raw[..len])?)
    }

    /// `WinUsb_SetPipePolicy`
    ///
    /// `value` holds the policy value in native byte order, at least four
    /// bytes.
    pub fn set_pipe_policy(&mut self, pipe_id: u8, policy_type: u32, value: &[u8]) -> bool {
        let result = self.try_set_pipe_policy(pipe_id, policy_type, value);
        self.complete(result, None)
    }

    pub fn try_set_pipe_policy(
        &mut self,
        pipe_id: u8,
        policy_type: u32,
        value: &[u8],
    ) -> Result<usize, BridgeError> {
        let kind = PipePolicyKind::try_from(policy_type)?;
        if value.len() < 4 {
            return Err(BridgeError::InvalidArgument);
        }

        let policy = PipePolicyPacket {
            policy_type: kind as u32,
            value: NativeEndian::read_u32(&value[..4]),
        };
        debug!("Pipe {:#04x}: {:?} = {}", pipe_id, kind, policy.value);
        self.command(Opcode::SetPipePolicy, &mut policy.to_bytes())
    }

    /// Transfer timeout in milliseconds for every later call, 0 = none
    pub fn set_timeout(&mut self, ms: u32) -> bool {
        let mut value = [0u8; 4];
        NativeEndian::write_u32(&mut value, ms);
        self.set_pipe_policy(0, PipePolicyKind::TransferTimeout as u32, &value)
    }

    /// One interrupt OUT packet
    pub fn write_interrupt(&mut self, data: &[u8]) -> bool {
        let result = self.try_write_interrupt(data);
        self.complete(result, None)
    }

    pub fn try_write_interrupt(&mut self, data: &[u8]) -> Result<usize, BridgeError> {
        if data.len() > INT_BUFF_LENGTH {
            return Err(BridgeError::BufferTooLarge);
        }
        let mut arg = InterruptPacket::with_data(data)?.to_bytes();
        self.command(Opcode::WriteInterrupt, &mut arg)
    }

    /// Whether the device is still bound
    pub fn check_connected(&mut self) -> bool {
        let result = self.command(Opcode::IsConnected, &mut []);
        self.complete(result, None)
    }

    pub fn vendor_product_id(&mut self) -> Result<VidPidPacket, BridgeError> {
        let mut arg = [0u8; VidPidPacket::SIZE];
        self.command(Opcode::GetVendorProductId, &mut arg)?;
        Ok(VidPidPacket::decode(&arg)?)
    }

    fn command(&mut self, opcode: Opcode, arg: &mut [u8]) -> Result<usize, BridgeError> {
        let rc = self.channel.ioctl(opcode.request_code(), arg)?;
        Ok(usize::try_from(rc).unwrap_or(0))
    }

    fn complete(
        &mut self,
        result: Result<usize, BridgeError>,
        length_transferred: Option<&mut usize>,
    ) -> bool {
        match result {
            Ok(len) => {
                if let Some(out) = length_transferred {
                    *out = len;
                }
                true
            }
            Err(e) => {
                debug!("{}: {}", self.path.display(), e);
                self.last_error = Some(e);
                false
            }
        }
    }
}
