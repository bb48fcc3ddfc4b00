//! Property tests for the wire format.

use bytes::Bytes;
use proptest::prelude::*;
use routeip::wire::{get_message_size, Header, Message, MessageType, PROTOCOL_VERSION};

fn message_type_strategy() -> impl Strategy<Value = MessageType> {
    prop_oneof![
        Just(MessageType::Request),
        Just(MessageType::RequestNoReturn),
        Just(MessageType::Notification),
        Just(MessageType::Response),
        Just(MessageType::Error),
    ]
}

proptest! {
    #[test]
    fn message_round_trips_through_the_wire(
        service in any::<u16>(),
        method in any::<u16>(),
        client in any::<u16>(),
        session in any::<u16>(),
        interface_version in any::<u8>(),
        return_code in 0u8..0x0B,
        message_type in message_type_strategy(),
        payload in proptest::collection::vec(any::<u8>(), 0..512),
    ) {
        let message = Message::new(
            Header {
                service_id: service,
                method_id: method,
                length: 0,
                client_id: client,
                session_id: session,
                protocol_version: PROTOCOL_VERSION,
                interface_version,
                message_type,
                return_code,
            },
            Bytes::from(payload),
        );

        let wire = message.serialize();

        // The declared size covers the full serialized message.
        prop_assert_eq!(get_message_size(&wire), wire.len());

        // Every field survives the round trip.
        let parsed = Message::parse(&mut wire.clone()).expect("serialized message parses");
        prop_assert_eq!(parsed, message);
    }

    #[test]
    fn parse_never_panics_on_arbitrary_bytes(data in proptest::collection::vec(any::<u8>(), 0..128)) {
        let mut cursor = &data[..];
        let _ = Message::parse(&mut cursor);
        let _ = get_message_size(&data);
    }
}
