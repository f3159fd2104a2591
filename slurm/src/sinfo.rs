// SPDX-FileCopyrightText: © 2024 Christopher Woods <Christopher.Woods@bristol.ac.uk>
// SPDX-License-Identifier: MIT

use clusterstats::source::{NodeDetail, NodeInventory};
use clusterstats::Error;
use once_cell::unsync::OnceCell;

use crate::runner::{SlurmCommand, SlurmRunner};

/// One line per node and partition: hostname, cpus, memory (MB), partition, state
const SINFO_FORMAT: &str = "%N|%c|%m|%P|%T";

fn parse_number(value: &str, field: &str, line: &str) -> Result<u64, Error> {
    value.trim().parse::<u64>().map_err(|e| {
        Error::Parse(format!(
            "Could not parse {} '{}' in '{}': {}",
            field, value, line, e
        ))
    })
}

///
/// Parse node-oriented `sinfo` output. Nodes in several partitions
/// appear once per partition, so these lines are merged, and the
/// `*` that marks the default partition is removed. Lines that
/// cannot be parsed are logged and skipped.
///
pub fn parse_sinfo_output(output: &str) -> Vec<NodeDetail> {
    let mut nodes: Vec<NodeDetail> = Vec::new();

    for line in output.lines() {
        let line = line.trim();

        if line.is_empty() {
            continue;
        }

        let fields: Vec<&str> = line.split('|').collect();

        if fields.len() != 5 {
            tracing::warn!("Skipping malformed sinfo line: '{}'", line);
            continue;
        }

        let hostname = fields[0].trim();

        let (cpus, memory_mb) = match (
            parse_number(fields[1], "cpus", line),
            parse_number(fields[2], "memory", line),
        ) {
            (Ok(cpus), Ok(memory_mb)) => (cpus, memory_mb),
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!("Skipping sinfo line: {}", e);
                continue;
            }
        };

        let partition = fields[3].trim().trim_end_matches('*').to_string();

        match nodes.iter_mut().find(|node| node.hostname() == hostname) {
            Some(node) => {
                let mut partitions = node.partitions().to_vec();

                if !partition.is_empty() && !partitions.contains(&partition) {
                    partitions.push(partition);
                }

                *node = NodeDetail::new(
                    node.hostname(),
                    node.cpus(),
                    node.memory_mb(),
                    &partitions,
                    node.state(),
                );
            }
            None => {
                let partitions: Vec<String> = match partition.is_empty() {
                    true => Vec::new(),
                    false => vec![partition],
                };

                nodes.push(NodeDetail::new(
                    hostname,
                    cpus,
                    memory_mb,
                    &partitions,
                    fields[4].trim(),
                ));
            }
        }
    }

    nodes
}

///
/// The compute nodes of the cluster as reported by `sinfo`. The
/// listing is fetched on first use and reused afterwards.
///
pub struct SinfoInventory {
    runner: SlurmRunner,
    nodes: OnceCell<Vec<NodeDetail>>,
}

impl SinfoInventory {
    pub fn new(runner: &SlurmRunner) -> Self {
        Self {
            runner: runner.clone(),
            nodes: OnceCell::new(),
        }
    }

    fn nodes(&self) -> Result<&[NodeDetail], Error> {
        let nodes = self.nodes.get_or_try_init(|| {
            let output = self.runner.call(
                SlurmCommand::Sinfo,
                &[
                    "--Node".to_string(),
                    "--noheader".to_string(),
                    format!("--format={}", SINFO_FORMAT),
                ],
            )?;

            let nodes = parse_sinfo_output(&output);
            tracing::debug!("Found {} nodes", nodes.len());

            Ok::<_, Error>(nodes)
        })?;

        Ok(nodes)
    }
}

impl NodeInventory for SinfoInventory {
    fn list_nodes(&self) -> Result<Vec<String>, Error> {
        Ok(self
            .nodes()?
            .iter()
            .map(|node| node.hostname().to_string())
            .collect())
    }

    fn node_detail(&self, hostname: &str) -> Result<NodeDetail, Error> {
        self.nodes()?
            .iter()
            .find(|node| node.hostname() == hostname)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Unknown node {}", hostname)))
    }
}
