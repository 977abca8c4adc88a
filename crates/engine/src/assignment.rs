// SPDX-FileCopyrightText: 2026 Aaron Dewes <aaron@nirvati.org>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use slugify::slugify;

use crate::error::ValidationError;
use crate::template::{InfraTemplate, TeamRole};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Assignee {
    pub user_id: String,
    /// The role the participant declared, must match the machine's role
    pub team_role: TeamRole,
}

/// Who plays which machine: team group -> logical machine -> assignee.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct TeamAssignment(pub BTreeMap<String, BTreeMap<String, Assignee>>);

/// One participant's place in a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seat<'a> {
    pub team_group: &'a str,
    pub machine: &'a str,
    pub assignee: &'a Assignee,
}

/// Prefix for cloud resource names of a team group.
pub fn team_slug(team_group: &str) -> String {
    slugify!(team_group)
}

impl TeamAssignment {
    pub fn team_groups(&self) -> Vec<String> {
        self.0.keys().cloned().collect()
    }

    pub fn group(&self, team_group: &str) -> Option<&BTreeMap<String, Assignee>> {
        self.0.get(team_group)
    }

    pub fn seats(&self) -> impl Iterator<Item = Seat<'_>> {
        self.0.iter().flat_map(|(team_group, machines)| {
            machines.iter().map(move |(machine, assignee)| Seat {
                team_group,
                machine,
                assignee,
            })
        })
    }

    /// Every machine of the template must be assigned exactly once in every
    /// group, to a participant declaring the machine's role.
    pub fn validate(&self, infra: &InfraTemplate) -> Result<(), ValidationError> {
        let invalid = |reason: String| Err(ValidationError::InvalidAssignment(reason));

        if self.0.is_empty() {
            return invalid("no team groups".to_string());
        }
        if infra.instances.is_empty() {
            return invalid("scenario has no machines to assign".to_string());
        }

        let mut slugs: HashMap<String, &str> = HashMap::new();
        let mut users: HashSet<&str> = HashSet::new();
        for (team_group, machines) in &self.0 {
            let slug = team_slug(team_group);
            if slug.is_empty() {
                return invalid(format!("team group name {team_group:?} is unusable"));
            }
            if let Some(other) = slugs.insert(slug.clone(), team_group) {
                return invalid(format!(
                    "team groups {other:?} and {team_group:?} both map to {slug}"
                ));
            }

            for instance in &infra.instances {
                let Some(assignee) = machines.get(&instance.name) else {
                    return invalid(format!(
                        "machine {} is not assigned in {team_group}",
                        instance.name
                    ));
                };
                if assignee.team_role != instance.role {
                    return invalid(format!(
                        "{} declared {} but machine {} is {}",
                        assignee.user_id, assignee.team_role, instance.name, instance.role
                    ));
                }
            }
            for (machine, assignee) in machines {
                if infra.instance(machine).is_none() {
                    return invalid(format!("unknown machine {machine} in {team_group}"));
                }
                if assignee.user_id.is_empty() {
                    return invalid(format!("machine {machine} in {team_group} has no user"));
                }
                if !users.insert(assignee.user_id.as_str()) {
                    return invalid(format!("user {} is assigned twice", assignee.user_id));
                }
            }
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::{assign, two_teams};
    use super::*;
    use crate::template::fixtures::range_template;

    #[test]
    fn test_valid_assignment() {
        let template = range_template();
        assert_eq!(two_teams().validate(&template.infra), Ok(()));
        assert_eq!(two_teams().seats().count(), 4);
        assert_eq!(two_teams().team_groups(), vec!["Team A", "Team B"]);
    }

    #[test]
    fn test_team_slug() {
        assert_eq!(team_slug("Team A"), "team-a");
    }

    #[test]
    fn test_missing_machine() {
        let template = range_template();
        let assignment = assign(&[("Team A", &[("attacker", "alice", TeamRole::Red)])]);
        assert!(matches!(
            assignment.validate(&template.infra),
            Err(ValidationError::InvalidAssignment(_))
        ));
    }

    #[test]
    fn test_role_mismatch() {
        let template = range_template();
        let assignment = assign(&[(
            "Team A",
            &[
                ("attacker", "alice", TeamRole::Blue),
                ("victim", "bob", TeamRole::Blue),
            ],
        )]);
        assert!(assignment.validate(&template.infra).is_err());
    }

    #[test]
    fn test_unknown_machine() {
        let template = range_template();
        let assignment = assign(&[(
            "Team A",
            &[
                ("attacker", "alice", TeamRole::Red),
                ("victim", "bob", TeamRole::Blue),
                ("printer", "eve", TeamRole::Blue),
            ],
        )]);
        assert!(assignment.validate(&template.infra).is_err());
    }

    #[test]
    fn test_user_assigned_twice() {
        let template = range_template();
        let assignment = assign(&[
            (
                "Team A",
                &[
                    ("attacker", "alice", TeamRole::Red),
                    ("victim", "bob", TeamRole::Blue),
                ],
            ),
            (
                "Team B",
                &[
                    ("attacker", "alice", TeamRole::Red),
                    ("victim", "dave", TeamRole::Blue),
                ],
            ),
        ]);
        assert!(assignment.validate(&template.infra).is_err());
    }

    #[test]
    fn test_colliding_group_slugs() {
        let template = range_template();
        let assignment = assign(&[
            (
                "Team A",
                &[
                    ("attacker", "alice", TeamRole::Red),
                    ("victim", "bob", TeamRole::Blue),
                ],
            ),
            (
                "team-a",
                &[
                    ("attacker", "carol", TeamRole::Red),
                    ("victim", "dave", TeamRole::Blue),
                ],
            ),
        ]);
        assert!(assignment.validate(&template.infra).is_err());
    }

    #[test]
    fn test_empty_assignment() {
        let template = range_template();
        assert!(TeamAssignment::default().validate(&template.infra).is_err());
    }
}
