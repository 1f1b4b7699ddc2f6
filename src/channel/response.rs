use crate::message::{reduce_statuses, DestinationOutcome, Response};

/// Collapses the settled destination outcomes of one message into the single
/// response offered to the caller. Outcomes must be given in destination
/// ordinal order; among destinations tied on the winning status, the lowest
/// ordinal supplies the response payload. Returns `None` when no outcome has
/// settled, which callers turn into a canned acknowledgement.
pub fn compose(outcomes: &[DestinationOutcome]) -> Option<Response> {
    let winner = reduce_statuses(outcomes.iter().map(|outcome| outcome.status))?;
    let representative = outcomes.iter().find(|outcome| outcome.status == winner)?;

    let mut response = Response::of(
        winner,
        representative.response.clone().unwrap_or_default(),
    );
    response.error = representative.error.clone();
    Some(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Status;

    #[test]
    fn error_outranks_every_other_outcome() {
        let outcomes = vec![
            DestinationOutcome::sent("archive", 1, "stored".into()),
            DestinationOutcome::queued("billing", 1, None),
            DestinationOutcome::errored("audit", 1, "connection refused".into()),
        ];

        let response = compose(&outcomes).unwrap();
        assert_eq!(response.status, Status::Error);
        assert_eq!(response.error.as_deref(), Some("connection refused"));
    }

    #[test]
    fn queued_outranks_sent_and_filtered() {
        let outcomes = vec![
            DestinationOutcome::filtered("archive"),
            DestinationOutcome::sent("billing", 1, "ok".into()),
            DestinationOutcome::queued("audit", 1, Some("timed out".into())),
        ];

        let response = compose(&outcomes).unwrap();
        assert_eq!(response.status, Status::Queued);
        assert_eq!(response.error.as_deref(), Some("timed out"));
    }

    #[test]
    fn lowest_ordinal_supplies_the_payload_on_ties() {
        let outcomes = vec![
            DestinationOutcome::sent("archive", 1, "first ack".into()),
            DestinationOutcome::sent("billing", 1, "second ack".into()),
        ];

        let response = compose(&outcomes).unwrap();
        assert_eq!(response.status, Status::Sent);
        assert_eq!(response.message, "first ack");
    }

    #[test]
    fn all_filtered_composes_a_filtered_response() {
        let outcomes = vec![
            DestinationOutcome::filtered("archive"),
            DestinationOutcome::filtered("billing"),
        ];

        let response = compose(&outcomes).unwrap();
        assert_eq!(response.status, Status::Filtered);
        assert_eq!(response.message, "");
    }

    #[test]
    fn nothing_settled_composes_nothing() {
        assert!(compose(&[]).is_none());
    }
}
