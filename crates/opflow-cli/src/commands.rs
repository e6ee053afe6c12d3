use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use opflow_graph::Graph;

use crate::cli::ShowOutput;

pub fn show(graph_file: &Path, output: ShowOutput) -> Result<()> {
    let graph = load(graph_file)?;
    match output {
        ShowOutput::Text => print!("{}", graph),
        ShowOutput::Dot => print!("{}", graph.to_dot()),
    }
    Ok(())
}

pub fn check(graph_file: &Path) -> Result<()> {
    let graph = load(graph_file)?;
    println!(
        "ok: {} operations, {} constants, {} sinks",
        graph.operations().len(),
        graph.values().len(),
        graph.sinks().len()
    );
    Ok(())
}

fn load(graph_file: &Path) -> Result<Graph> {
    let bytes = std::fs::read(graph_file)
        .with_context(|| format!("reading {}", graph_file.display()))?;
    debug!(bytes = bytes.len(), "loaded graph file");
    Graph::unmarshal(&bytes).with_context(|| format!("parsing {}", graph_file.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use opflow_graph::GraphBuilder;
    use std::io::Write as _;

    fn sample_file() -> tempfile::NamedTempFile {
        let b = GraphBuilder::new();
        let addr_ref = b.const_resource_addr("test_thing.example".parse().unwrap());
        let prior = b.resource_instance_prior(addr_ref);
        b.set_sink("test_thing.example".parse().unwrap(), prior);
        let bytes = b.finish().marshal().unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&bytes).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn check_accepts_a_valid_graph_file() {
        let file = sample_file();
        assert!(check(file.path()).is_ok());
    }

    #[test]
    fn check_rejects_garbage() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"not a graph").unwrap();
        assert!(check(file.path()).is_err());
    }

    #[test]
    fn show_renders_both_formats() {
        let file = sample_file();
        assert!(show(file.path(), ShowOutput::Text).is_ok());
        assert!(show(file.path(), ShowOutput::Dot).is_ok());
    }
}
