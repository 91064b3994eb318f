//! Integration tests for the command-channel wire format
//!
//! Verifies the opcode table, request-code validation and the fixed packet
//! layouts against arbitrary caller input.
//!
//! Run with: `cargo test -p protocol --test protocol_tests`

use proptest::prelude::*;
use protocol::{
    CTRL_BUFF_LENGTH, Command, ControlPacket, DescriptorPacket, INT_BUFF_LENGTH, InterruptPacket,
    Opcode, PipePolicyPacket, ProtocolError, Reply, SetupPacket, WirePacket,
};

mod opcode_table {
    use super::*;

    #[test]
    fn test_opcode_numbers_are_stable() {
        let numbers: Vec<u8> = Opcode::ALL.iter().map(|op| *op as u8).collect();
        assert_eq!(numbers, vec![0, 1, 2, 3, 5, 6, 7]);
    }

    #[test]
    fn test_packet_sizes_are_stable() {
        assert_eq!(Opcode::SendControl.packet_size(), 136);
        assert_eq!(Opcode::ReceiveControl.packet_size(), 136);
        assert_eq!(Opcode::GetDescriptor.packet_size(), 136);
        assert_eq!(Opcode::SetPipePolicy.packet_size(), 8);
        assert_eq!(Opcode::GetVendorProductId.packet_size(), 4);
        assert_eq!(Opcode::IsConnected.packet_size(), 0);
        assert_eq!(Opcode::WriteInterrupt.packet_size(), 65);
    }

    #[test]
    fn test_every_opcode_decodes_its_own_size() {
        for op in Opcode::ALL {
            let payload = vec![0u8; op.packet_size()];
            let command = Command::decode(op, &payload).expect("own size must decode");
            assert_eq!(command.opcode(), op);
        }
    }
}

mod control_replies {
    use super::*;

    #[test]
    fn test_received_reply_roundtrip_through_packet() {
        let setup = SetupPacket {
            request_type: 0xC0,
            request: 0x33,
            value: 0,
            index: 0,
            length: 64,
        };
        let mut arg = ControlPacket::new(setup).to_bytes();
        let reply = Reply::Received(vec![0x5A; 10]);

        reply.write_output(&mut arg).unwrap();

        assert_eq!(reply.return_value(), 10);
        let data = ControlPacket::reply_data(&arg, reply.return_value() as usize).unwrap();
        assert_eq!(data, &[0x5A; 10]);
        // header untouched
        assert_eq!(ControlPacket::decode(&arg).unwrap().setup, setup);
    }

    #[test]
    fn test_oversized_reply_is_rejected() {
        let mut arg = vec![0u8; ControlPacket::SIZE];
        let result = Reply::Received(vec![0; CTRL_BUFF_LENGTH + 1]).write_output(&mut arg);
        assert!(matches!(
            result,
            Err(ProtocolError::CapacityExceeded { .. })
        ));
    }
}

proptest! {
    #[test]
    fn prop_request_codes_resolve_or_fail_cleanly(code in any::<u32>()) {
        match Opcode::from_request_code(code) {
            Ok(op) => prop_assert_eq!(op.request_code(), code),
            Err(ProtocolError::ForeignMagic(_))
            | Err(ProtocolError::UnknownOpcode(_))
            | Err(ProtocolError::RequestMismatch { .. }) => {}
            Err(other) => prop_assert!(false, "unexpected error {:?}", other),
        }
    }

    #[test]
    fn prop_wrong_payload_length_never_decodes(op_index in 0usize..7, len in 0usize..300) {
        let op = Opcode::ALL[op_index];
        prop_assume!(len != op.packet_size());
        let payload = vec![0u8; len];
        prop_assert!(Command::decode(op, &payload).is_err());
    }

    #[test]
    fn prop_control_validation_matches_capacity(length in any::<u16>()) {
        let packet = ControlPacket::new(SetupPacket {
            request_type: 0x80,
            length,
            ..Default::default()
        });
        let command = Command::ReceiveControl(packet);
        prop_assert_eq!(command.validate().is_ok(), usize::from(length) <= CTRL_BUFF_LENGTH);
    }

    #[test]
    fn prop_interrupt_validation_matches_capacity(raw in proptest::collection::vec(any::<u8>(), 65)) {
        let packet = InterruptPacket::decode(&raw).unwrap();
        let valid = usize::from(raw[0]) <= INT_BUFF_LENGTH;
        prop_assert_eq!(Command::WriteInterrupt(packet.clone()).validate().is_ok(), valid);
        prop_assert!(packet.payload().len() <= INT_BUFF_LENGTH);
    }

    #[test]
    fn prop_descriptor_reply_never_touches_header(
        desc_type in any::<u8>(),
        index in any::<u8>(),
        data in proptest::collection::vec(any::<u8>(), 0..=128),
    ) {
        let mut arg = DescriptorPacket::new(desc_type, index).to_bytes();
        Reply::Descriptor(data.clone()).write_output(&mut arg).unwrap();
        let decoded = DescriptorPacket::decode(&arg).unwrap();
        prop_assert_eq!(decoded.descriptor_type, u32::from(desc_type));
        prop_assert_eq!(decoded.index, index);
        prop_assert_eq!(&decoded.data[..data.len()], data.as_slice());
    }

    #[test]
    fn prop_pipe_policy_fields_survive(policy_type in any::<u32>(), value in any::<u32>()) {
        let packet = PipePolicyPacket { policy_type, value };
        let decoded = PipePolicyPacket::decode(&packet.to_bytes()).unwrap();
        prop_assert_eq!(decoded, packet);
    }
}
