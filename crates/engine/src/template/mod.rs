// SPDX-FileCopyrightText: 2026 Aaron Dewes <aaron@nirvati.org>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scoring::{DecayMode, ScoringConfig};

mod loader;

pub use loader::RepoTemplateStore;

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("Scenario template {0} not found")]
    NotFound(String),
    #[error("Scenario id contains invalid characters: {0}")]
    InvalidId(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse scenario template: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Inconsistent scenario template {scenario_id}: {reason}")]
    Inconsistent { scenario_id: String, reason: String },
}

/// Which machines of a team's clone a participant may access.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum TeamRole {
    Red,
    Blue,
    Purple,
    Yellow,
}

impl fmt::Display for TeamRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TeamRole::Red => "RED",
            TeamRole::Blue => "BLUE",
            TeamRole::Purple => "PURPLE",
            TeamRole::Yellow => "YELLOW",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for TeamRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "RED" => Ok(TeamRole::Red),
            "BLUE" => Ok(TeamRole::Blue),
            "PURPLE" => Ok(TeamRole::Purple),
            "YELLOW" => Ok(TeamRole::Yellow),
            other => Err(format!("unknown team role {other}")),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct NetworkTemplate {
    pub name: String,
    pub cidr: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RouterTemplate {
    pub name: String,
    /// Whether the router gets a gateway on the public network
    #[serde(default)]
    pub external: bool,
    /// Logical networks whose subnets are attached to this router
    #[serde(default)]
    pub subnets: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct InstanceTemplate {
    pub name: String,
    pub image_id: String,
    pub flavor_id: String,
    pub networks: Vec<String>,
    pub role: TeamRole,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct InfraTemplate {
    #[serde(default)]
    pub networks: Vec<NetworkTemplate>,
    #[serde(default)]
    pub routers: Vec<RouterTemplate>,
    #[serde(default)]
    pub instances: Vec<InstanceTemplate>,
}

impl InfraTemplate {
    pub fn instance(&self, name: &str) -> Option<&InstanceTemplate> {
        self.instances.iter().find(|i| i.name == name)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Flag,
    Milestone,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Flag => "flag",
            ItemKind::Milestone => "milestone",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Hint {
    pub text: String,
    #[serde(default)]
    pub penalty: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TemplateItem {
    pub id: String,
    pub kind: ItemKind,
    #[serde(default)]
    pub phase_id: Option<String>,
    pub base_score: u32,
    /// Items starting locked stay hidden until an admin unlocks them
    #[serde(default)]
    pub is_locked: bool,
    #[serde(default)]
    pub hint: Option<Hint>,
    /// Expected answer, flags only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl TemplateItem {
    /// Submitted answers are compared after trimming surrounding whitespace.
    pub fn check_answer(&self, submitted: &str) -> bool {
        self.answer
            .as_deref()
            .is_some_and(|answer| answer.trim() == submitted.trim())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct RoleItems {
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub milestones: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScenarioTemplate {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub infra: InfraTemplate,
    #[serde(default)]
    pub items: Vec<TemplateItem>,
    #[serde(default)]
    pub roles: BTreeMap<TeamRole, RoleItems>,
}

impl ScenarioTemplate {
    pub fn item(&self, item_id: &str) -> Option<&TemplateItem> {
        self.items.iter().find(|i| i.id == item_id)
    }

    /// Flags first, then milestones, each in the order the role lists them.
    pub fn items_for_role(&self, role: TeamRole) -> Vec<&TemplateItem> {
        let Some(assigned) = self.roles.get(&role) else {
            return vec![];
        };
        assigned
            .flags
            .iter()
            .chain(assigned.milestones.iter())
            .filter_map(|id| self.item(id))
            .collect()
    }

    pub fn validate(&self) -> Result<(), TemplateError> {
        let fail = |reason: String| {
            Err(TemplateError::Inconsistent {
                scenario_id: self.id.clone(),
                reason,
            })
        };

        let networks = match unique_names(self.infra.networks.iter().map(|n| n.name.as_str())) {
            Ok(networks) => networks,
            Err(dup) => return fail(format!("duplicate network {dup}")),
        };
        if let Err(dup) = unique_names(self.infra.routers.iter().map(|r| r.name.as_str())) {
            return fail(format!("duplicate router {dup}"));
        }
        if let Err(dup) = unique_names(self.infra.instances.iter().map(|i| i.name.as_str())) {
            return fail(format!("duplicate instance {dup}"));
        }
        for router in &self.infra.routers {
            if let Some(missing) = router.subnets.iter().find(|s| !networks.contains(s.as_str())) {
                return fail(format!(
                    "router {} references unknown network {missing}",
                    router.name
                ));
            }
        }
        for instance in &self.infra.instances {
            if instance.networks.is_empty() {
                return fail(format!("instance {} has no networks", instance.name));
            }
            if let Some(missing) = instance
                .networks
                .iter()
                .find(|n| !networks.contains(n.as_str()))
            {
                return fail(format!(
                    "instance {} references unknown network {missing}",
                    instance.name
                ));
            }
        }

        let items: HashMap<&str, &TemplateItem> =
            self.items.iter().map(|i| (i.id.as_str(), i)).collect();
        if items.len() != self.items.len() {
            return fail("duplicate item ids".to_string());
        }
        for item in &self.items {
            if item.kind == ItemKind::Flag
                && item.answer.as_deref().is_none_or(|a| a.trim().is_empty())
            {
                return fail(format!("flag {} has no answer", item.id));
            }
        }
        for (role, assigned) in &self.roles {
            for (ids, kind) in [
                (&assigned.flags, ItemKind::Flag),
                (&assigned.milestones, ItemKind::Milestone),
            ] {
                for id in ids {
                    match items.get(id.as_str()) {
                        Some(item) if item.kind == kind => {}
                        Some(_) => {
                            return fail(format!(
                                "{role} lists {id} as a {} but it is not one",
                                kind.as_str()
                            ));
                        }
                        None => return fail(format!("{role} references unknown item {id}")),
                    }
                }
            }
        }

        if let ScoringConfig::Decay(decay) = &self.scoring {
            if decay.mode == DecayMode::Time && decay.interval_minutes == 0 {
                return fail("time decay requires interval_minutes > 0".to_string());
            }
        }
        Ok(())
    }
}

fn unique_names<'a>(names: impl Iterator<Item = &'a str>) -> Result<HashSet<&'a str>, String> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(name.to_string());
        }
    }
    Ok(seen)
}

/// Read-only source of scenario templates.
#[async_trait::async_trait]
pub trait TemplateStore: Send + Sync {
    async fn load(&self, scenario_id: &str) -> Result<Arc<ScenarioTemplate>, TemplateError>;
}

/// Templates held in memory, for embedding and tests.
#[derive(Default)]
pub struct MemoryTemplateStore {
    templates: HashMap<String, Arc<ScenarioTemplate>>,
}

impl MemoryTemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, template: ScenarioTemplate) -> Result<(), TemplateError> {
        template.validate()?;
        self.templates
            .insert(template.id.clone(), Arc::new(template));
        Ok(())
    }
}

#[async_trait::async_trait]
impl TemplateStore for MemoryTemplateStore {
    async fn load(&self, scenario_id: &str) -> Result<Arc<ScenarioTemplate>, TemplateError> {
        self.templates
            .get(scenario_id)
            .cloned()
            .ok_or_else(|| TemplateError::NotFound(scenario_id.to_string()))
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub const RANGE_YML: &str = r#"
id: web-breach
name: Web breach
scoring:
  type: decay
  mode: time
  start_after_minutes: 15
  interval_minutes: 10
  penalty_per_interval: 10
  min_score: 20
infra:
  networks:
    - name: dmz
      cidr: 10.0.1.0/24
    - name: internal
      cidr: 10.0.2.0/24
  routers:
    - name: edge
      external: true
      subnets: [dmz, internal]
  instances:
    - name: attacker
      image_id: kali
      flavor_id: m1.small
      networks: [dmz]
      role: RED
    - name: victim
      image_id: ubuntu
      flavor_id: m1.small
      networks: [dmz, internal]
      role: BLUE
items:
  - id: initial-access
    kind: flag
    phase_id: recon
    base_score: 100
    answer: "FLAG{in}"
    hint:
      text: Look at the login form
      penalty: 30
  - id: root
    kind: flag
    phase_id: exploit
    base_score: 200
    answer: "FLAG{root}"
    is_locked: true
  - id: detect
    kind: flag
    phase_id: recon
    base_score: 100
    answer: "FLAG{seen}"
  - id: incident-report
    kind: milestone
    phase_id: exploit
    base_score: 150
    description: Write up the intrusion timeline
roles:
  RED:
    flags: [initial-access, root]
  BLUE:
    flags: [detect]
    milestones: [incident-report]
"#;

    pub fn range_template() -> ScenarioTemplate {
        serde_yaml::from_str(RANGE_YML).unwrap()
    }

    pub fn template_store() -> Arc<MemoryTemplateStore> {
        let mut store = MemoryTemplateStore::new();
        store.insert(range_template()).unwrap();
        Arc::new(store)
    }
}
