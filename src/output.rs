use std::fs::File;
use std::io::{self, Write, BufWriter};
use std::path::PathBuf;
use anyhow::Result;
use colored::*;

use crate::cli::OutputFormat;
use crate::probe::connection::join_host_port;
use crate::probe::ProbeReport;

pub struct OutputWriter {
    format: OutputFormat,
    file: Option<PathBuf>,
}

impl OutputWriter {
    pub fn new(format: OutputFormat, file: Option<PathBuf>) -> Result<Self> {
        Ok(Self { format, file })
    }

    pub fn write(&self, report: &ProbeReport) -> Result<()> {
        let output = self.render(report)?;

        match &self.file {
            Some(path) => {
                let file = File::create(path)?;
                let mut writer = BufWriter::new(file);
                writer.write_all(output.as_bytes())?;
                writer.flush()?;
            }
            None => {
                print!("{}", output);
                io::stdout().flush()?;
            }
        }

        Ok(())
    }

    pub fn render(&self, report: &ProbeReport) -> Result<String> {
        match self.format {
            OutputFormat::Human => Ok(self.format_human(report)),
            OutputFormat::Json => Ok(serde_json::to_string_pretty(report)?),
            OutputFormat::Csv => Ok(self.format_csv(report)),
        }
    }

    fn format_human(&self, report: &ProbeReport) -> String {
        let mut output = String::new();

        output.push_str(&format!("\n{}\n\n",
            "RDP PROBE COMPLETE".truecolor(0, 255, 65).bold()));

        output.push_str(&format!("{} {} {} {} {} {}\n\n",
            "⟦".truecolor(64, 64, 64),
            report.target_spec.truecolor(255, 255, 255).bold(),
            "•".truecolor(0, 255, 65),
            format!("run {}", report.run_id).truecolor(255, 140, 0).bold(),
            format!("{}ms", (report.end_time - report.start_time).num_milliseconds()).truecolor(0, 212, 255).bold(),
            "⟧".truecolor(64, 64, 64)));

        let mut rdp_count = 0;
        let mut nla_count = 0;

        for target in &report.targets {
            let endpoint = join_host_port(&target.host, target.port);

            match &target.presence {
                Some(presence) if presence.is_rdp => {
                    rdp_count += 1;
                    output.push_str(&format!("{} {} {} {}\n",
                        "▶".truecolor(0, 255, 65).bold(),
                        endpoint.truecolor(255, 255, 255).bold(),
                        "rdp".truecolor(0, 255, 65),
                        presence.os.truecolor(128, 128, 128)));

                    if let Some(auth) = &target.auth {
                        if auth.auth_required {
                            nla_count += 1;
                            let protocol = auth.service_info.as_ref()
                                .and_then(|i| i.selected_protocol.clone())
                                .unwrap_or_default();
                            output.push_str(&format!("  {} {}\n",
                                "● auth required".truecolor(255, 140, 0),
                                protocol.truecolor(128, 128, 128)));
                        } else {
                            output.push_str(&format!("  {}\n",
                                "● no network-level authentication".truecolor(255, 64, 64).bold()));
                        }
                    }
                }
                Some(_) => {
                    output.push_str(&format!("  {} {}\n",
                        endpoint.truecolor(128, 128, 128),
                        "not rdp".truecolor(64, 64, 64)));
                }
                None => {}
            }

            for error in &target.errors {
                output.push_str(&format!("  {} {} {}\n",
                    endpoint.truecolor(128, 128, 128),
                    "✗".truecolor(255, 64, 64),
                    error.truecolor(128, 128, 128)));
            }
        }

        output.push_str(&format!("\n{} {} {} {}\n",
            "⚡".truecolor(0, 255, 65).bold(),
            format!("{} endpoints probed", report.targets.len()).truecolor(255, 255, 255).bold(),
            format!("• {} rdp", rdp_count).truecolor(0, 212, 255).bold(),
            format!("• {} require auth", nla_count).truecolor(191, 64, 191).bold()));

        output
    }

    fn format_csv(&self, report: &ProbeReport) -> String {
        let mut csv = String::new();
        csv.push_str("host,port,is_rdp,os,auth_required,selected_protocol,error\n");

        for target in &report.targets {
            let is_rdp = target.presence.as_ref().map(|p| p.is_rdp.to_string()).unwrap_or_default();
            let os = target.presence.as_ref().map(|p| p.os.as_str()).unwrap_or("");
            let auth_required = target.auth.as_ref().map(|a| a.auth_required.to_string()).unwrap_or_default();
            let protocol = target.auth.as_ref()
                .and_then(|a| a.service_info.as_ref())
                .and_then(|i| i.selected_protocol.as_deref())
                .unwrap_or("");

            csv.push_str(&format!(
                "{},{},{},{},{},{},{}\n",
                csv_field(&target.host),
                target.port,
                is_rdp,
                csv_field(os),
                auth_required,
                protocol,
                csv_field(&target.errors.join("; ")),
            ));
        }

        csv
    }
}

fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{AuthResult, PresenceResult, RunId, ServiceRdp, TargetReport};

    fn sample_report() -> ProbeReport {
        let now = chrono::Utc::now();
        ProbeReport {
            run_id: RunId::from("run-1"),
            target_spec: "acme.test".to_string(),
            start_time: now,
            end_time: now,
            targets: vec![
                TargetReport {
                    host: "acme.test".to_string(),
                    port: 3389,
                    presence: Some(PresenceResult::from_detection("Windows Server 2019".into(), true)),
                    auth: Some(AuthResult::from_detection(
                        ServiceRdp {
                            selected_protocol: Some("HYBRID".to_string()),
                            ..Default::default()
                        },
                        true,
                    )),
                    errors: Vec::new(),
                },
                TargetReport {
                    host: "acme.test".to_string(),
                    port: 3390,
                    presence: None,
                    auth: None,
                    errors: vec!["dial acme.test:3390 failed: connection refused: x, y".to_string()],
                },
            ],
        }
    }

    #[test]
    fn test_csv_output() {
        let writer = OutputWriter::new(OutputFormat::Csv, None).unwrap();
        let csv = writer.render(&sample_report()).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1], "acme.test,3389,true,Windows Server 2019,true,HYBRID,");
        assert!(lines[2].starts_with("acme.test,3390,,,,,\"dial"));
    }

    #[test]
    fn test_json_output() {
        let writer = OutputWriter::new(OutputFormat::Json, None).unwrap();
        let json = writer.render(&sample_report()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["run_id"], "run-1");
        assert_eq!(value["targets"][0]["presence"]["IsRDP"], true);
        assert_eq!(value["targets"][0]["auth"]["PluginInfo"]["selectedProtocol"], "HYBRID");
    }

    #[test]
    fn test_human_output_to_file() {
        colored::control::set_override(false);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.txt");

        let writer = OutputWriter::new(OutputFormat::Human, Some(path.clone())).unwrap();
        writer.write(&sample_report()).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("acme.test:3389 rdp Windows Server 2019"));
        assert!(text.contains("auth required HYBRID"));
        assert!(text.contains("2 endpoints probed"));
    }

    #[test]
    fn test_human_output_brackets_ipv6() {
        colored::control::set_override(false);
        let mut report = sample_report();
        report.targets[0].host = "::1".to_string();

        let writer = OutputWriter::new(OutputFormat::Human, None).unwrap();
        let text = writer.render(&report).unwrap();
        assert!(text.contains("[::1]:3389 rdp"));
        assert!(!text.contains(" ::1:3389"));
    }
}
