use courier::channel::compose;
use courier::message::{
    reduce_statuses, DestinationOutcome, Status, RESPONSE_STATUS_PRECEDENCE,
};
use proptest::prelude::*;

const ALL_STATUSES: [Status; 6] = [
    Status::Received,
    Status::Filtered,
    Status::Transformed,
    Status::Sent,
    Status::Queued,
    Status::Error,
];

fn status_vec() -> impl Strategy<Value = Vec<Status>> {
    prop::collection::vec(any::<u8>(), 0..12).prop_map(|choices| {
        choices
            .into_iter()
            .map(|choice| ALL_STATUSES[(choice as usize) % ALL_STATUSES.len()])
            .collect()
    })
}

fn outcome_vec() -> impl Strategy<Value = Vec<DestinationOutcome>> {
    prop::collection::vec(any::<u8>(), 0..8).prop_map(|choices| {
        choices
            .into_iter()
            .enumerate()
            .map(|(index, choice)| {
                let name = format!("destination-{index}");
                match choice % 4 {
                    0 => DestinationOutcome::sent(name, 1, format!("ack-{index}")),
                    1 => DestinationOutcome::queued(name, 1, Some(format!("fault-{index}"))),
                    2 => DestinationOutcome::errored(name, 1, format!("fault-{index}")),
                    _ => DestinationOutcome::filtered(name),
                }
            })
            .collect()
    })
}

proptest! {
    #[test]
    fn the_winner_is_the_highest_precedence_status_present(statuses in status_vec()) {
        let expected = RESPONSE_STATUS_PRECEDENCE
            .iter()
            .copied()
            .find(|candidate| statuses.contains(candidate));
        prop_assert_eq!(reduce_statuses(statuses.iter().copied()), expected);
    }

    #[test]
    fn the_winner_ignores_arrival_order(statuses in status_vec(), rotate_by in 0usize..12) {
        let forward = reduce_statuses(statuses.iter().copied());

        let mut reversed = statuses.clone();
        reversed.reverse();
        prop_assert_eq!(reduce_statuses(reversed.into_iter()), forward);

        let mut rotated = statuses;
        if !rotated.is_empty() {
            let pivot = rotate_by % rotated.len();
            rotated.rotate_left(pivot);
        }
        prop_assert_eq!(reduce_statuses(rotated.into_iter()), forward);
    }

    #[test]
    fn unsettled_statuses_never_win(choices in prop::collection::vec(any::<bool>(), 0..8)) {
        let statuses: Vec<Status> = choices
            .into_iter()
            .map(|received| if received { Status::Received } else { Status::Transformed })
            .collect();
        prop_assert_eq!(reduce_statuses(statuses.into_iter()), None);
    }

    #[test]
    fn composed_status_matches_the_reduced_statuses(outcomes in outcome_vec()) {
        let composed = compose(&outcomes);
        let reduced = reduce_statuses(outcomes.iter().map(|outcome| outcome.status));
        prop_assert_eq!(composed.map(|response| response.status), reduced);
    }

    #[test]
    fn the_first_winning_destination_supplies_the_payload(outcomes in outcome_vec()) {
        match compose(&outcomes) {
            Some(response) => {
                let representative = outcomes
                    .iter()
                    .find(|outcome| outcome.status == response.status)
                    .expect("a composed response implies a winning outcome");
                prop_assert_eq!(
                    response.message.as_str(),
                    representative.response.as_deref().unwrap_or("")
                );
                prop_assert_eq!(response.error.as_deref(), representative.error.as_deref());
            }
            None => prop_assert!(outcomes.is_empty()),
        }
    }
}
