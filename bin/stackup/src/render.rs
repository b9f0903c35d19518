//! Terminal tables for `plan` and `status`.

use comfy_table::{Table, presets::UTF8_FULL};
use stackup_deploy::{DeploymentGraph, RegistryEntry};

/// One row per step, grouped by the wave it runs in.
pub fn plan_table(graph: &DeploymentGraph, waves: &[Vec<usize>]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_header(vec!["Wave", "Step", "Contract", "Depends on", "Wiring"]);

    for (wave, indices) in waves.iter().enumerate() {
        for &index in indices {
            let step = &graph.steps[index];
            let depends_on = graph
                .dependencies(index)
                .into_iter()
                .map(|dep| graph.steps[dep].name.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            let wiring = step
                .wiring
                .iter()
                .map(|call| match &call.output {
                    Some(output) => format!("{call} -> {output}"),
                    None => call.to_string(),
                })
                .collect::<Vec<_>>()
                .join("\n");

            table.add_row(vec![
                (wave + 1).to_string(),
                step.name.clone(),
                step.contract_name().to_string(),
                depends_on,
                wiring,
            ]);
        }
    }

    table
}

/// One row per registry entry.
pub fn status_table(entries: &[RegistryEntry]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_header(vec!["Step", "Address", "Transaction", "Block", "Deployed at"]);

    for entry in entries {
        table.add_row(vec![
            entry.name.clone(),
            entry.address.clone(),
            entry.tx_hash.clone().unwrap_or_default(),
            entry
                .block_number
                .map(|block| block.to_string())
                .unwrap_or_default(),
            entry
                .deployed_at
                .map(|at| at.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                .unwrap_or_default(),
        ]);
    }

    table
}
