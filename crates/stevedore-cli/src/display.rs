//! Display formatting for CLI output

use console::style;
use stevedore_core::{ConnectStrings, WellKnownAlias};

/// Render the connect table
///
/// Cluster-advertised targets come first, followed by the built-in aliases
/// that are always available.
pub fn connect_table(connections: &ConnectStrings) -> String {
    let mut out = String::new();

    if connections.is_empty() {
        out.push_str("No connect targets are advertised in this cluster\n");
    } else {
        out.push_str(&format!(
            "{:<40} {}\n",
            style("CONNECT COMMAND").bold(),
            style("DESCRIPTION").bold()
        ));
        for (name, connection) in connections {
            out.push_str(&format!(
                "{:<40} {}\n",
                format!("stevedore connect {}", name),
                connection.description
            ));
        }
    }

    let builtin: Vec<_> = WellKnownAlias::ALL
        .iter()
        .map(|a| a.name().to_lowercase())
        .collect();
    out.push_str(&format!(
        "\n{} {}\n",
        style("Built-in targets:").dim(),
        builtin.join(", ")
    ));

    out
}
