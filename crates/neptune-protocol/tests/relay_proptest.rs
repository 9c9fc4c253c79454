use neptune_protocol::{history_entry, prepare_forward, DropReason};
use neptune_transport::RelayMessage;
use proptest::prelude::*;

fn node() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{0,11}"
}

fn relay(hops: u32, max_hops: u32, history: Vec<String>) -> RelayMessage {
    let mut msg = RelayMessage::new("m-prop", "alice@origin", "bob@far", "ciphertext");
    msg.hops = hops;
    msg.max_hops = max_hops;
    msg.history = history;
    msg
}

proptest! {
    #[test]
    fn relay_step_never_passes_max_hops(
        hops in 0u32..16,
        max_hops in 0u32..16,
        path in proptest::collection::vec(node(), 1..24),
    ) {
        let mut msg = relay(hops.min(max_hops), max_hops, Vec::new());
        for (i, name) in path.iter().enumerate() {
            match prepare_forward(&msg, name, i as u64) {
                Ok(next) => {
                    prop_assert!(next.hops <= next.max_hops);
                    prop_assert_eq!(next.hops, msg.hops + 1);
                    prop_assert_eq!(next.history.len(), msg.history.len() + 1);
                    msg = next;
                }
                Err(DropReason::HopLimit { hops, max_hops }) => {
                    prop_assert_eq!(hops, max_hops);
                    break;
                }
                Err(DropReason::Loop) => prop_assert!(msg.has_visited(name)),
                Err(other) => prop_assert!(false, "unexpected drop: {other}"),
            }
        }
    }

    #[test]
    fn node_never_forwards_what_it_already_relayed(
        local in node(),
        before in proptest::collection::vec(node(), 0..4),
        after in proptest::collection::vec(node(), 0..4),
        secs in any::<u32>(),
        max_hops in 0u32..16,
    ) {
        let history: Vec<String> = before
            .iter()
            .chain(std::iter::once(&local))
            .chain(after.iter())
            .map(|n| history_entry(n, u64::from(secs)))
            .collect();
        // Loop detection wins over the hop ceiling.
        let msg = relay(0, max_hops, history);
        prop_assert_eq!(prepare_forward(&msg, &local, 0), Err(DropReason::Loop));
    }
}
