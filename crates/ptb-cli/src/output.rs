//! `list`'s table/json duality. Grounded in `list_executor.py`'s box-drawing
//! Experiment → Instance → Interface tree, rendered here as either a plain
//! table (default) or a JSON document for scripting (`-o/--output`).

use colored::Colorize;
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
}

#[derive(Debug, Serialize)]
pub struct ListedInterface {
    pub bridge: String,
    pub tap: String,
    pub mac: String,
}

#[derive(Debug, Serialize)]
pub struct ListedInstance {
    pub name: String,
    pub uuid: String,
    pub pid: u32,
    pub experiment: String,
    pub owner: String,
    pub mgmt_ip: String,
    pub running: bool,
    pub interfaces: Vec<ListedInterface>,
}

pub fn render_instances(format: OutputFormat, instances: &[ListedInstance]) -> String {
    match format {
        OutputFormat::Json => serde_json::to_string_pretty(instances).unwrap_or_default(),
        OutputFormat::Table => render_table(instances),
    }
}

fn render_table(instances: &[ListedInstance]) -> String {
    if instances.is_empty() {
        return "No experiments are running for that search criteria.".to_string();
    }

    let mut by_experiment: Vec<(&str, &str, Vec<&ListedInstance>)> = Vec::new();
    for instance in instances {
        match by_experiment
            .iter_mut()
            .find(|(exp, owner, _)| *exp == instance.experiment && *owner == instance.owner)
        {
            Some((_, _, group)) => group.push(instance),
            None => by_experiment.push((&instance.experiment, &instance.owner, vec![instance])),
        }
    }

    let mut out = String::new();
    let last_experiment = by_experiment.len().saturating_sub(1);
    for (exp_index, (experiment, owner, group)) in by_experiment.iter().enumerate() {
        let is_last_experiment = exp_index == last_experiment;
        let exp_prefix = if is_last_experiment { "└─" } else { "├─" };
        let running = group.iter().any(|i| i.running);
        let status = if running { "running".green() } else { "dangling".yellow() };
        out.push_str(&format!(
            "{exp_prefix} Experiment: {experiment}, Owner: {owner}, Status: {status}\n"
        ));

        let last_instance = group.len().saturating_sub(1);
        for (inst_index, instance) in group.iter().enumerate() {
            let is_last_instance = inst_index == last_instance;
            let inst_prefix = format!(
                "{} {}",
                if is_last_experiment { " " } else { "│" },
                if is_last_instance { "└─" } else { "├─" }
            );
            out.push_str(&format!(
                "{inst_prefix} Instance: {} ({}) (IP: {})\n",
                instance.name, instance.uuid, instance.mgmt_ip
            ));

            let last_iface = instance.interfaces.len().saturating_sub(1);
            for (if_index, iface) in instance.interfaces.iter().enumerate() {
                let is_last_iface = if_index == last_iface;
                let if_prefix = format!(
                    "{} {} {}",
                    if is_last_experiment { " " } else { "│" },
                    if is_last_instance { " " } else { "│" },
                    if is_last_iface { "└─" } else { "├─" }
                );
                out.push_str(&format!(
                    "{if_prefix} {} ({}) connected to bridge {}\n",
                    iface.tap, iface.mac, iface.bridge
                ));
            }
        }
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<ListedInstance> {
        vec![ListedInstance {
            name: "alice".to_string(),
            uuid: "11111111-1111-1111-1111-111111111111".to_string(),
            pid: 42,
            experiment: "run-1".to_string(),
            owner: "root".to_string(),
            mgmt_ip: "10.0.0.5".to_string(),
            running: true,
            interfaces: vec![ListedInterface {
                bridge: "ptb-b-aaaaaaaa".to_string(),
                tap: "ptb-t-aaaaaaaa".to_string(),
                mac: "02:aa:bb:cc:dd:00".to_string(),
            }],
        }]
    }

    #[test]
    fn test_render_instances_json_round_trips() {
        let rendered = render_instances(OutputFormat::Json, &sample());
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed[0]["name"], "alice");
    }

    #[test]
    fn test_render_instances_table_mentions_instance_and_interface() {
        let rendered = render_instances(OutputFormat::Table, &sample());
        assert!(rendered.contains("Instance: alice"));
        assert!(rendered.contains("ptb-t-aaaaaaaa"));
    }

    #[test]
    fn test_render_instances_table_empty() {
        let rendered = render_instances(OutputFormat::Table, &[]);
        assert!(rendered.contains("No experiments"));
    }
}
