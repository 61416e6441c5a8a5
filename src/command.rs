//! The command envelope (spec §4.B "Command envelope", §6 schema).
//!
//! `proto::Envelope` is the prost-generated wire type; [`Command`] is the
//! validated, internal representation the state machine actually applies.
//! Decoding (`Command::try_from(&[u8])`) and encoding (`Command::encode`)
//! are the only places that touch the wire format, matching the corpus
//! convention of keeping `prost` types at the edge (see `rule-bridge`'s
//! gRPC layer and `knhk-consensus`'s `bincode`-at-the-edge state entries).

use prost::Message;

use crate::rule::{BucketKey, Rule};

pub mod proto {
    #![allow(clippy::all)]
    include!(concat!(env!("OUT_DIR"), "/policy_dispatcher.rs"));
}

/// The operation to apply, decoded from an [`proto::Envelope`] (spec §6).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    AddRules {
        key: BucketKey,
        rules: Vec<Rule>,
    },
    RemoveRules {
        key: BucketKey,
        rules: Vec<Rule>,
    },
    RemoveFiltered {
        key: BucketKey,
        field_index: usize,
        field_values: Vec<String>,
    },
    UpdateRule {
        key: BucketKey,
        old_rule: Rule,
        new_rule: Rule,
    },
    UpdateRules {
        key: BucketKey,
        old_rules: Vec<Rule>,
        new_rules: Vec<Rule>,
    },
    ClearAll,
}

#[derive(Debug, thiserror::Error)]
pub enum CommandDecodeError {
    #[error(transparent)]
    Proto(#[from] prost::DecodeError),

    #[error("envelope is missing a required field: {0}")]
    MissingField(&'static str),

    #[error("envelope specifies an unrecognized operation tag: {0}")]
    UnknownOperation(i32),
}

fn rules_from_string_arrays(arrays: Vec<proto::StringArray>) -> Vec<Rule> {
    arrays.into_iter().map(|a| Rule(a.items)).collect()
}

impl Command {
    pub fn decode(bytes: &[u8]) -> Result<Command, CommandDecodeError> {
        let envelope = proto::Envelope::decode(bytes)?;
        Command::try_from(envelope)
    }

    pub fn encode(&self) -> Vec<u8> {
        let envelope: proto::Envelope = self.clone().into();
        envelope.encode_to_vec()
    }

    pub fn bucket_key(&self) -> Option<&BucketKey> {
        match self {
            Command::AddRules { key, .. }
            | Command::RemoveRules { key, .. }
            | Command::RemoveFiltered { key, .. }
            | Command::UpdateRule { key, .. }
            | Command::UpdateRules { key, .. } => Some(key),
            Command::ClearAll => None,
        }
    }
}

impl TryFrom<proto::Envelope> for Command {
    type Error = CommandDecodeError;

    fn try_from(e: proto::Envelope) -> Result<Self, Self::Error> {
        let op = proto::envelope::Operation::from_i32(e.operation)
            .ok_or(CommandDecodeError::UnknownOperation(e.operation))?;
        let key = BucketKey::new(e.sec, e.p_type);

        Ok(match op {
            proto::envelope::Operation::Add => Command::AddRules {
                key,
                rules: rules_from_string_arrays(e.rules),
            },
            proto::envelope::Operation::Remove => Command::RemoveRules {
                key,
                rules: rules_from_string_arrays(e.rules),
            },
            proto::envelope::Operation::RemoveFiltered => Command::RemoveFiltered {
                key,
                field_index: e.field_index.max(0) as usize,
                field_values: e.field_values,
            },
            proto::envelope::Operation::Update => Command::UpdateRule {
                key,
                old_rule: Rule(
                    e.old_rule
                        .ok_or(CommandDecodeError::MissingField("old_rule"))?
                        .items,
                ),
                new_rule: Rule(
                    e.new_rule
                        .ok_or(CommandDecodeError::MissingField("new_rule"))?
                        .items,
                ),
            },
            proto::envelope::Operation::UpdateBatch => Command::UpdateRules {
                key,
                old_rules: rules_from_string_arrays(e.old_rules),
                new_rules: rules_from_string_arrays(e.rules),
            },
            proto::envelope::Operation::Clear => Command::ClearAll,
            proto::envelope::Operation::Unspecified => {
                return Err(CommandDecodeError::UnknownOperation(0))
            }
        })
    }
}

impl From<Command> for proto::Envelope {
    fn from(cmd: Command) -> Self {
        let mut e = proto::Envelope::default();

        match cmd {
            Command::AddRules { key, rules } => {
                e.operation = proto::envelope::Operation::Add as i32;
                e.sec = key.sec;
                e.p_type = key.p_type;
                e.rules = rules.into_iter().map(|r| proto::StringArray { items: r.0 }).collect();
            }
            Command::RemoveRules { key, rules } => {
                e.operation = proto::envelope::Operation::Remove as i32;
                e.sec = key.sec;
                e.p_type = key.p_type;
                e.rules = rules.into_iter().map(|r| proto::StringArray { items: r.0 }).collect();
            }
            Command::RemoveFiltered {
                key,
                field_index,
                field_values,
            } => {
                e.operation = proto::envelope::Operation::RemoveFiltered as i32;
                e.sec = key.sec;
                e.p_type = key.p_type;
                e.field_index = field_index as i32;
                e.field_values = field_values;
            }
            Command::UpdateRule {
                key,
                old_rule,
                new_rule,
            } => {
                e.operation = proto::envelope::Operation::Update as i32;
                e.sec = key.sec;
                e.p_type = key.p_type;
                e.old_rule = Some(proto::StringArray { items: old_rule.0 });
                e.new_rule = Some(proto::StringArray { items: new_rule.0 });
            }
            Command::UpdateRules {
                key,
                old_rules,
                new_rules,
            } => {
                e.operation = proto::envelope::Operation::UpdateBatch as i32;
                e.sec = key.sec;
                e.p_type = key.p_type;
                e.old_rules = old_rules.into_iter().map(|r| proto::StringArray { items: r.0 }).collect();
                e.rules = new_rules.into_iter().map(|r| proto::StringArray { items: r.0 }).collect();
            }
            Command::ClearAll => {
                e.operation = proto::envelope::Operation::Clear as i32;
            }
        }

        e
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_rules_round_trips_through_the_wire() {
        let cmd = Command::AddRules {
            key: BucketKey::new("p", "p"),
            rules: vec![Rule::new(["alice", "data1", "read"])],
        };
        let bytes = cmd.encode();
        let decoded = Command::decode(&bytes).unwrap();
        assert_eq!(cmd, decoded);
    }

    #[test]
    fn update_rule_round_trips_through_the_wire() {
        let cmd = Command::UpdateRule {
            key: BucketKey::new("p", "p"),
            old_rule: Rule::new(["a", "x", "r"]),
            new_rule: Rule::new(["a", "x", "w"]),
        };
        let bytes = cmd.encode();
        assert_eq!(Command::decode(&bytes).unwrap(), cmd);
    }

    #[test]
    fn unknown_operation_tag_is_rejected() {
        let envelope = proto::Envelope {
            operation: 99,
            ..Default::default()
        };
        let bytes = envelope.encode_to_vec();
        assert!(matches!(
            Command::decode(&bytes),
            Err(CommandDecodeError::UnknownOperation(99))
        ));
    }
}
