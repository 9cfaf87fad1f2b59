// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Append-only journal of the faults this harness injected and the keys it
//! rotated, kept in a statefile so an interrupted run can be cleaned up.

use std::{
    collections::HashMap,
    fmt,
    fs::{File, OpenOptions},
    io::{BufRead, BufReader, Write},
    sync::Mutex,
};

use chrono::{Local, NaiveDateTime};

#[derive(Debug)]
pub enum StateError {
    Io {
        path: String,
        err: std::io::Error,
    },
    Parse {
        line: String,
        what: String,
    },
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StateError::Io { path, err } => write!(f, "statefile {path}: {err}"),
            StateError::Parse { line, what } => write!(f, "bad statefile line '{line}': {what}"),
        }
    }
}

impl std::error::Error for StateError {}

/// Net effect of every journaled event: which gateways are still down and
/// how often each subsystem had its keys replaced.
#[derive(Debug, Default, Clone)]
pub struct Delta {
    pub gateways_failed: HashMap<String, bool>,
    pub keys_rotated: HashMap<String, u32>,
}

impl Delta {
    pub fn new() -> Self {
        Delta::default()
    }

    pub fn new_from_file(path: &str, file: &File) -> Result<Self, StateError> {
        let records = Record::get_all_from_file(path, file)?;
        let mut delta = Self::new();
        for record in records {
            delta.apply(&record);
        }
        Ok(delta)
    }

    fn apply(&mut self, record: &Record) {
        match record.event {
            Event::Fail => {
                self.gateways_failed.insert(record.subject.clone(), true);
            }
            Event::Restore => {
                self.gateways_failed.insert(record.subject.clone(), false);
            }
            Event::KeyRotate => {
                *self.keys_rotated.entry(record.subject.clone()).or_insert(0) += 1;
            }
        }
    }

    /// Gateways that were failed and never restored, sorted for stable
    /// cleanup order.
    pub fn failed_gateways(&self) -> Vec<String> {
        let mut down: Vec<String> = self
            .gateways_failed
            .iter()
            .filter(|(_, failed)| **failed)
            .map(|(id, _)| id.clone())
            .collect();
        down.sort();
        down
    }
}

#[derive(Debug)]
pub struct State {
    path: String,
    file: Mutex<File>,
    /// Net state from earlier runs plus everything recorded since open.
    delta: Mutex<Delta>,
}

impl State {
    pub fn new(path: &str) -> Result<Self, StateError> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)
            .map_err(|err| StateError::Io {
                path: path.to_string(),
                err,
            })?;
        let delta = Delta::new_from_file(path, &file)?;
        Ok(Self {
            path: path.to_string(),
            file: Mutex::new(file),
            delta: Mutex::new(delta),
        })
    }

    pub fn delta(&self) -> Delta {
        self.delta.lock().unwrap().clone()
    }

    /// Append a single record and fold it into the running delta.
    pub fn write_record(&self, record: Record) -> Result<(), StateError> {
        self.file
            .lock()
            .unwrap()
            .write_all(&[record.as_string().as_bytes(), &[b'\n']].concat())
            .map_err(|err| StateError::Io {
                path: self.path.clone(),
                err,
            })?;
        self.delta.lock().unwrap().apply(&record);
        Ok(())
    }

    pub fn record(
        &self,
        event: Event,
        subject: &str,
        comment: Option<String>,
    ) -> Result<(), StateError> {
        self.write_record(Record::new(event, subject.to_string(), comment))
    }
}

/// A single journaled event.
#[derive(Debug, PartialEq)]
pub struct Record {
    pub timestamp: NaiveDateTime,
    pub event: Event,
    /// Gateway node for fail/restore, subsystem NQN for key rotation.
    pub subject: String,
    pub comment: Option<String>,
}

impl Record {
    pub fn new(event: Event, subject: String, comment: Option<String>) -> Self {
        Record {
            timestamp: Local::now().naive_local(),
            event,
            subject,
            comment,
        }
    }

    /// All records in a statefile, sorted by timestamp in ascending order.
    pub fn get_all_from_file(path: &str, file: &File) -> Result<Vec<Record>, StateError> {
        let lines = BufReader::new(file).lines();
        let mut records: Vec<Record> = lines
            .map(|line| -> Result<Record, StateError> {
                let line = line.map_err(|err| StateError::Io {
                    path: path.to_string(),
                    err,
                })?;
                Record::from_string(&line)
            })
            .collect::<Result<Vec<Record>, StateError>>()?;
        records.sort_by_key(|record| record.timestamp);
        Ok(records)
    }

    pub fn as_string(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}",
            self.timestamp.format("%Y-%m-%dT%H:%M:%S.%f"),
            self.event,
            self.subject,
            match self.comment {
                Some(ref comment) => comment,
                None => "",
            },
        )
    }

    pub fn from_string(record: &str) -> Result<Self, StateError> {
        let parse_err = |what: &str| StateError::Parse {
            line: record.to_string(),
            what: what.to_string(),
        };
        let mut fields = record.split('\t');
        let timestamp = fields.next().ok_or_else(|| parse_err("missing timestamp"))?;
        let event = fields.next().ok_or_else(|| parse_err("missing event"))?;
        let subject = fields.next().ok_or_else(|| parse_err("missing subject"))?;
        let mut comment = String::from(fields.next().unwrap_or(""));
        for remainder in fields {
            comment.push('\t');
            comment.push_str(remainder);
        }

        let timestamp = NaiveDateTime::parse_from_str(timestamp, "%Y-%m-%dT%H:%M:%S.%f")
            .map_err(|err| parse_err(&format!("bad timestamp: {err}")))?;

        Ok(Self {
            timestamp,
            event: Event::try_from(event)?,
            subject: subject.to_string(),
            comment: Some(comment),
        })
    }
}

/// All events the journal can hold.
#[derive(Debug, PartialEq)]
pub enum Event {
    /// A gateway daemon was stopped on purpose.
    Fail,
    /// A stopped gateway daemon was started again.
    Restore,
    /// A subsystem had its DHCHAP keys replaced.
    KeyRotate,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        write!(
            f,
            "{}",
            match self {
                Self::Fail => "fail",
                Self::Restore => "restore",
                Self::KeyRotate => "rotate-key",
            }
        )
    }
}

impl TryFrom<&str> for Event {
    type Error = StateError;
    fn try_from(val: &str) -> Result<Self, Self::Error> {
        Ok(match val {
            "fail" => Self::Fail,
            "restore" => Self::Restore,
            "rotate-key" => Self::KeyRotate,
            _ => {
                return Err(StateError::Parse {
                    line: val.to_string(),
                    what: "unknown event".to_string(),
                })
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_round_trip_through_the_line_format() {
        let record = Record::new(Event::Fail, "node-2".to_string(), Some("systemctl".to_string()));
        let parsed = Record::from_string(&record.as_string()).unwrap();
        assert_eq!(parsed.event, Event::Fail);
        assert_eq!(parsed.subject, "node-2");
        assert_eq!(parsed.comment.as_deref(), Some("systemctl"));
        assert_eq!(parsed.timestamp, record.timestamp);
    }

    #[test]
    fn delta_keeps_the_last_word_per_gateway() {
        let mut delta = Delta::new();
        for (event, subject) in [
            (Event::Fail, "node-1"),
            (Event::Fail, "node-2"),
            (Event::Restore, "node-1"),
            (Event::KeyRotate, "nqn.2016-06.io.spdk:cnode1"),
            (Event::KeyRotate, "nqn.2016-06.io.spdk:cnode1"),
        ] {
            delta.apply(&Record::new(event, subject.to_string(), None));
        }
        assert_eq!(delta.failed_gateways(), vec!["node-2".to_string()]);
        assert_eq!(delta.keys_rotated["nqn.2016-06.io.spdk:cnode1"], 2);
    }

    #[test]
    fn unknown_events_fail_to_parse() {
        assert!(Record::from_string("2025-03-01T10:00:00.000000\tfence\tnode-1\t").is_err());
        assert!(Record::from_string("not a record").is_err());
    }
}
