/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::errors::ScenarioError;
use itertools::Itertools;
use std::collections::BTreeMap;

/// The pieces a pipeline config is assembled from. Each fragment is a YAML mapping with a single
/// top-level key naming the component, e.g. `"batch:\n  timeout: 1s\n"`.
#[derive(Debug, Clone)]
pub struct PipelineConfig<'a> {
    pub pipeline_type: &'a str,
    pub receiver: &'a str,
    pub exporter: &'a str,
    /// Keyed by component id. Processors run in the order of their ids.
    pub processors: &'a BTreeMap<String, String>,
    pub extensions: &'a BTreeMap<String, String>,
    pub metrics_port: Option<u16>,
}

/// Renders a single pipeline config document.
///
/// The output only depends on the input, so identical inputs always produce byte-identical
/// documents.
pub fn render(config: &PipelineConfig) -> Result<String, ScenarioError> {
    let receiver = component_id(config.receiver)?;
    let exporter = component_id(config.exporter)?;
    check_ids(config.processors, "processor")?;
    check_ids(config.extensions, "extension")?;

    let mut doc = String::new();
    doc.push_str(&section("receivers", [config.receiver]));
    doc.push_str(&section("exporters", [config.exporter]));
    doc.push_str(&section(
        "processors",
        config.processors.values().map(String::as_str),
    ));
    doc.push_str(&section(
        "extensions",
        config.extensions.values().map(String::as_str),
    ));

    let metrics = match config.metrics_port {
        Some(port) => format!("    metrics:\n      address: 127.0.0.1:{port}\n"),
        None => String::new(),
    };
    doc.push_str(&format!(
        "service:\n  extensions: [{extensions}]\n  telemetry:\n    logs:\n      level: \"info\"\n\
         {metrics}  pipelines:\n    {pipeline}:\n      receivers: [{receiver}]\n      \
         processors: [{processors}]\n      exporters: [{exporter}]\n",
        extensions = config.extensions.keys().join(", "),
        pipeline = config.pipeline_type,
        processors = config.processors.keys().join(", "),
    ));

    Ok(doc)
}

/// The top-level key of a fragment.
fn component_id(fragment: &str) -> Result<&str, ScenarioError> {
    let header = fragment
        .lines()
        .find(|line| !line.trim().is_empty())
        .ok_or_else(|| ScenarioError::config("empty component fragment"))?;

    match header.strip_suffix(':') {
        Some(id) if !id.is_empty() && !id.starts_with(char::is_whitespace) => Ok(id),
        _ => Err(ScenarioError::config(format!(
            "component fragment must start with `<id>:`, found `{header}`"
        ))),
    }
}

fn check_ids(components: &BTreeMap<String, String>, kind: &str) -> Result<(), ScenarioError> {
    for (id, fragment) in components {
        let declared = component_id(fragment)?;
        if declared != id {
            return Err(ScenarioError::config(format!(
                "{kind} `{id}` is configured as `{declared}`"
            )));
        }
    }
    Ok(())
}

fn section<'a>(name: &str, fragments: impl IntoIterator<Item = &'a str>) -> String {
    let mut fragments = fragments.into_iter().peekable();
    if fragments.peek().is_none() {
        return format!("{name}: {{}}\n");
    }

    let mut out = format!("{name}:\n");
    for fragment in fragments {
        for line in fragment.lines() {
            if !line.trim().is_empty() {
                out.push_str("  ");
                out.push_str(line.trim_end());
            }
            out.push('\n');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processors() -> BTreeMap<String, String> {
        BTreeMap::from([
            (
                "memory_limiter".to_string(),
                "memory_limiter:\n  check_interval: 1s\n  limit_mib: 200\n".to_string(),
            ),
            (
                "batch".to_string(),
                "batch:\n  send_batch_size: 1024\n".to_string(),
            ),
        ])
    }

    fn config<'a>(
        processors: &'a BTreeMap<String, String>,
        extensions: &'a BTreeMap<String, String>,
    ) -> PipelineConfig<'a> {
        PipelineConfig {
            pipeline_type: "logs",
            receiver: "filelog:\n  include: [ \"/tmp/load.log\" ]\n",
            exporter: "syslog:\n  endpoint: 127.0.0.1\n  port: 54001\n",
            processors,
            extensions,
            metrics_port: Some(8888),
        }
    }

    #[test]
    fn renders_a_complete_document() -> anyhow::Result<()> {
        let processors = processors();
        let extensions = BTreeMap::new();

        let doc = render(&config(&processors, &extensions))?;
        let expected = "\
receivers:
  filelog:
    include: [ \"/tmp/load.log\" ]
exporters:
  syslog:
    endpoint: 127.0.0.1
    port: 54001
processors:
  batch:
    send_batch_size: 1024
  memory_limiter:
    check_interval: 1s
    limit_mib: 200
extensions: {}
service:
  extensions: []
  telemetry:
    logs:
      level: \"info\"
    metrics:
      address: 127.0.0.1:8888
  pipelines:
    logs:
      receivers: [filelog]
      processors: [batch, memory_limiter]
      exporters: [syslog]
";
        assert_eq!(doc, expected);
        Ok(())
    }

    #[test]
    fn metrics_section_is_left_out_without_a_port() -> anyhow::Result<()> {
        let processors = BTreeMap::new();
        let extensions = BTreeMap::new();
        let mut config = config(&processors, &extensions);
        config.metrics_port = None;

        let doc = render(&config)?;
        assert!(!doc.contains("metrics:"));
        assert!(doc.contains("processors: {}\n"));
        assert!(doc.ends_with(
            "      level: \"info\"\n  pipelines:\n    logs:\n      receivers: [filelog]\n      \
             processors: []\n      exporters: [syslog]\n"
        ));
        Ok(())
    }

    #[test]
    fn identical_inputs_render_identically() -> anyhow::Result<()> {
        let extensions = BTreeMap::from([(
            "file_storage".to_string(),
            "file_storage:\n  directory: /tmp/checkpoints\n".to_string(),
        )]);

        let first = render(&config(&processors(), &extensions))?;
        let second = render(&config(&processors(), &extensions))?;
        assert_eq!(first, second);
        assert!(first.contains("  extensions: [file_storage]\n"));
        Ok(())
    }

    #[test]
    fn mismatched_component_id_is_a_config_error() {
        let processors = BTreeMap::from([("batch".to_string(), "filter:\n".to_string())]);
        let extensions = BTreeMap::new();

        let res = render(&config(&processors, &extensions));
        assert!(matches!(res, Err(ScenarioError::Config { .. })));
    }

    #[test]
    fn fragment_without_header_is_a_config_error() {
        let processors = BTreeMap::new();
        let extensions = BTreeMap::new();
        let mut config = config(&processors, &extensions);
        config.receiver = "  include: []\n";

        assert!(render(&config).is_err());
        config.receiver = "";
        assert!(render(&config).is_err());
    }
}
