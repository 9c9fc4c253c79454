use neptune_transport::{format_id, Envelope, MessageType, NeptuneId, RelayMessage};
use proptest::prelude::*;

fn part() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9._-]{1,24}"
}

fn text() -> impl Strategy<Value = String> {
    ".{0,120}".prop_filter("non-blank", |t| !t.trim().is_empty())
}

/// Every constructor, with the key material each one needs to validate.
fn any_envelope() -> impl Strategy<Value = Envelope> {
    (0usize..8, part(), part(), text(), part()).prop_map(|(kind, sender, peer, text, code)| {
        let sender = format!("{sender}@n1");
        let channel = format!("#{peer}");
        let recipient = format!("{peer}@n2");
        match kind {
            0 => {
                let mut env = Envelope::channel_message(&sender, &channel, &text).unwrap();
                env.crypto.channel_key_id = Some(format!("key-{code}"));
                env
            }
            1 => {
                let mut env = Envelope::private_message(&sender, &recipient, &text).unwrap();
                env.crypto.public_key = Some(code);
                env
            }
            2 => Envelope::join(&sender, &channel).unwrap(),
            3 => Envelope::leave(&sender, &channel).unwrap(),
            4 => Envelope::ping(&sender).unwrap(),
            5 => Envelope::pong(&recipient, &Envelope::ping(&sender).unwrap()).unwrap(),
            6 => Envelope::error(&sender, &recipient, &text, Some(code.as_str())).unwrap(),
            _ => Envelope::error(&sender, &recipient, &text, None).unwrap(),
        }
    })
}

proptest! {
    #[test]
    fn id_format_parse_inverse(local in part(), server in part()) {
        let s = format_id(&local, &server).unwrap();
        let id: NeptuneId = s.parse().unwrap();
        prop_assert_eq!(id.local(), local.as_str());
        prop_assert_eq!(id.server(), server.as_str());
        prop_assert_eq!(id.to_string(), s);
    }

    #[test]
    fn frame_roundtrip(
        id in "[a-f0-9-]{1,36}",
        from in part(),
        payload in ".{0,512}",
        hops in 0u32..5,
        history in proptest::collection::vec("[a-z0-9-]{1,12}:[0-9]{1,10}", 0..5),
    ) {
        let mut msg = RelayMessage::new(id, format!("{from}@origin"), "bob@far", payload);
        msg.hops = hops;
        msg.history = history;
        let frame = msg.encode_frame().unwrap();
        prop_assert_eq!(RelayMessage::decode_frame(&frame, 1 << 20).unwrap(), msg);
    }

    #[test]
    fn decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
        let _ = RelayMessage::decode_frame(&bytes, 1 << 16);
        let mut framed = b"NEPT".to_vec();
        framed.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        framed.extend_from_slice(&bytes);
        let _ = RelayMessage::decode_frame(&framed, 1 << 16);
    }

    #[test]
    fn validation_is_total(json in "\\{.{0,200}\\}") {
        if let Ok(env) = Envelope::from_json(&json) {
            let _ = env.is_valid();
        }
    }

    #[test]
    fn constructed_envelopes_roundtrip(env in any_envelope()) {
        prop_assert!(env.is_valid());
        let back = Envelope::from_json(&env.to_json().unwrap()).unwrap();
        prop_assert_eq!(&back, &env);

        // Ping has no destination and never travels as a relay frame.
        if env.header.message_type != MessageType::Ping {
            let relay = RelayMessage::from_envelope(&env).unwrap();
            let frame = relay.encode_frame().unwrap();
            let decoded = RelayMessage::decode_frame(&frame, 1 << 20).unwrap();
            prop_assert_eq!(&decoded, &relay);
            prop_assert_eq!(RelayMessage::from_envelope(&decoded.to_envelope()).unwrap(), relay);
        }
    }

    #[test]
    fn private_message_json_roundtrip(sender in part(), recipient in part(), text in ".{1,200}") {
        prop_assume!(!text.trim().is_empty());
        let mut env = Envelope::private_message(&sender, &recipient, &text).unwrap();
        env.crypto.public_key = Some("pk".into());
        let back = Envelope::from_json(&env.to_json().unwrap()).unwrap();
        prop_assert_eq!(&back, &env);
        prop_assert!(back.is_valid());
        prop_assert_eq!(back.header.message_type, MessageType::Privmsg);
    }
}
