//! MITM rule commands

use anyhow::{Context, Result};
use canbadger_proto::mitm::{self, ByteMask, ConditionKind, MitmRule, Pattern, RuleKind};
use canbadger_session::ProbeClient;
use clap::Args;
use std::path::Path;

use crate::output::{OutputContext, RuleRow};

/// Fields of one rule given on the command line
#[derive(Debug, Clone, Args)]
pub struct RuleArgs {
    /// Rule kind index (0 swap payload .. 8 drop frame)
    #[arg(long)]
    pub kind: u8,

    /// Condition kind index (0 payload matches .. 3 bytes are less)
    #[arg(long, default_value = "0")]
    pub condition: u8,

    /// Arbitration id the rule applies to (hex); all frames when omitted
    #[arg(long)]
    pub target: Option<String>,

    /// Condition byte mask, e.g. 11000000
    #[arg(long, default_value = "00000000")]
    pub condition_mask: String,

    /// Condition bytes (hex, up to 8)
    #[arg(long, default_value = "")]
    pub condition_value: String,

    /// Action byte mask
    #[arg(long, default_value = "00000000")]
    pub action_mask: String,

    /// Action argument bytes (hex, up to 8)
    #[arg(long, default_value = "")]
    pub action_argument: String,
}

impl RuleArgs {
    pub fn to_rule(&self) -> Result<MitmRule> {
        let kind = RuleKind::from_index(self.kind)
            .with_context(|| format!("Unknown rule kind {}", self.kind))?;
        let condition = ConditionKind::from_index(self.condition)
            .with_context(|| format!("Unknown condition kind {}", self.condition))?;

        let mut rule = MitmRule::new(kind, condition)
            .with_condition(
                self.condition_value.parse::<Pattern>()?,
                self.condition_mask.parse::<ByteMask>()?,
            )
            .with_action(
                self.action_argument.parse::<Pattern>()?,
                self.action_mask.parse::<ByteMask>()?,
            );
        if let Some(target) = &self.target {
            rule = rule.with_target(target)?;
        }
        Ok(rule)
    }
}

/// Print the rule line for the given fields
pub fn encode(args: &RuleArgs) -> Result<()> {
    println!("{}", args.to_rule()?.encode());
    Ok(())
}

/// Show the rules in a rule file
pub fn decode(file: &Path, ctx: &OutputContext) -> Result<()> {
    let rules = read_rules(file)?;
    let rows: Vec<RuleRow> = rules
        .iter()
        .enumerate()
        .map(|(index, rule)| RuleRow {
            index,
            target: rule.target_id().unwrap_or("any").to_string(),
            condition: rule.condition_kind.label().to_string(),
            condition_mask: rule.condition_mask.to_string(),
            condition_value: rule.condition_value.to_string(),
            action: rule.rule_kind.label().to_string(),
            action_mask: rule.action_mask.to_string(),
            action_argument: rule.action_argument.to_string(),
        })
        .collect();
    ctx.print(&rows);
    Ok(())
}

/// Push a rule file to the probe and enable MITM mode
pub async fn push(client: &ProbeClient, file: &Path, ctx: &OutputContext) -> Result<()> {
    let rules = read_rules(file)?;
    let active = client.push_rules(&rules).await?;
    ctx.success(&format!("{active} rule(s) active"));
    Ok(())
}

/// Enable MITM mode from a rule file stored on the probe
pub async fn start(client: &ProbeClient, name: &str, ctx: &OutputContext) -> Result<()> {
    let file_name = mitm::rule_file_name(name);
    client.start_mitm_from_file(&file_name).await?;
    ctx.success(&format!(
        "MITM mode started from {}/{file_name}",
        mitm::MITM_DIRECTORY
    ));
    Ok(())
}

fn read_rules(file: &Path) -> Result<Vec<MitmRule>> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read rule file: {}", file.display()))?;
    mitm::decode_rules(&text).with_context(|| format!("Invalid rule file: {}", file.display()))
}
