// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

#[cfg(test)]
mod tests {
    use chrono::Local;

    use cuttle_lib::state::{Event, Record, State};
    use cuttle_lib::test_env;

    #[test]
    fn record_round_trip() {
        let record = Record {
            timestamp: Local::now().naive_local(),
            event: Event::Fail,
            subject: "node6".to_string(),
            comment: Some("stopped by systemctl".to_string()),
        };
        let output = record.as_string();

        let new_record = Record::from_string(&output).unwrap();

        assert_eq!(record, new_record);
    }

    #[test]
    fn comment_may_contain_tabs() {
        let record = Record::new(
            Event::KeyRotate,
            "nqn.2016-06.io.spdk:cnode1".to_string(),
            Some("old\tnew".to_string()),
        );
        let parsed = Record::from_string(&record.as_string()).unwrap();
        assert_eq!(parsed.comment.as_deref(), Some("old\tnew"));
    }

    #[test]
    fn malformed_lines_are_rejected() {
        assert!(Record::from_string("not a record").is_err());
        assert!(Record::from_string("2026-01-01T00:00:00.0\tbogus-event\tnode6").is_err());
    }

    #[test]
    fn journal_tracks_net_state() {
        let path = test_env::statefile("state_journal");
        let state = State::new(&path).unwrap();
        state.record(Event::Fail, "node6", None).unwrap();
        state
            .record(Event::Fail, "node7", Some("will be restored".to_string()))
            .unwrap();
        state.record(Event::Restore, "node7", None).unwrap();
        state
            .record(Event::KeyRotate, "nqn.2016-06.io.spdk:cnode1", None)
            .unwrap();

        let delta = state.delta();
        assert_eq!(delta.failed_gateways(), vec!["node6".to_string()]);
        assert_eq!(delta.keys_rotated.get("nqn.2016-06.io.spdk:cnode1"), Some(&1));

        // A second open replays the journal into the same net state.
        let reopened = State::new(&path).unwrap();
        assert_eq!(reopened.delta().failed_gateways(), vec!["node6".to_string()]);
    }
}
