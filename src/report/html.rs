//! HTML result table.

use quick_xml::Writer;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};

use super::RunSummary;
use crate::judge::{TestCaseResult, Verdict};

const STYLE: &str = "body{font-family:sans-serif}\
table{border-collapse:collapse}\
td,th{border:1px solid #ccc;padding:4px 8px;text-align:left}\
.AC{color:#2a2}.WA,.CE,.AE,.RE,.IE{color:#c22}.TLE{color:#c80}";

/// Renders the results as a standalone HTML page titled with the run id.
pub fn render(results: &[TestCaseResult], summary: &RunSummary) -> anyhow::Result<String> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

    writer.write_event(Event::DocType(BytesText::from_escaped("html")))?;
    writer.write_event(Event::Start(BytesStart::new("html")))?;

    writer.write_event(Event::Start(BytesStart::new("head")))?;
    writer.write_event(Event::Empty(BytesStart::new("meta").with_attributes([("charset", "utf-8")])))?;
    text_element(&mut writer, "title", &summary.run_id)?;
    text_element(&mut writer, "style", STYLE)?;
    writer.write_event(Event::End(BytesEnd::new("head")))?;

    writer.write_event(Event::Start(BytesStart::new("body")))?;
    text_element(&mut writer, "h1", &summary.run_id)?;
    text_element(
        &mut writer,
        "p",
        &format!(
            "{}/{} accepted in {:.1}s",
            summary.accepted, summary.total, summary.duration_secs
        ),
    )?;

    writer.write_event(Event::Start(BytesStart::new("table")))?;
    writer.write_event(Event::Start(BytesStart::new("tr")))?;
    for header in ["Test case", "Verdict", "Perf", "Comment", "Input", "Output", "Answer"] {
        text_element(&mut writer, "th", header)?;
    }
    writer.write_event(Event::End(BytesEnd::new("tr")))?;

    for result in results {
        write_row(&mut writer, result)?;
    }

    writer.write_event(Event::End(BytesEnd::new("table")))?;
    writer.write_event(Event::End(BytesEnd::new("body")))?;
    writer.write_event(Event::End(BytesEnd::new("html")))?;

    Ok(String::from_utf8(writer.into_inner())?)
}

fn write_row(writer: &mut Writer<Vec<u8>>, result: &TestCaseResult) -> anyhow::Result<()> {
    writer.write_event(Event::Start(BytesStart::new("tr")))?;
    text_element(writer, "td", &result.full_name())?;

    writer.write_event(Event::Start(
        BytesStart::new("td").with_attributes([("class", result.verdict.code())]),
    ))?;
    writer.write_event(Event::Text(BytesText::new(verdict_label(result.verdict))))?;
    writer.write_event(Event::End(BytesEnd::new("td")))?;

    text_element(writer, "td", result.perf.as_deref().unwrap_or(""))?;
    text_element(writer, "td", &result.comment)?;
    link_cell(writer, Some(&result.stdin.display().to_string()))?;
    link_cell(writer, result.stdout.as_ref().map(|p| p.display().to_string()).as_deref())?;
    link_cell(writer, Some(&result.answer.display().to_string()))?;

    writer.write_event(Event::End(BytesEnd::new("tr")))?;
    Ok(())
}

fn verdict_label(verdict: Verdict) -> &'static str {
    match verdict {
        Verdict::Accepted => "Accepted",
        Verdict::WrongAnswer => "Wrong Answer",
        Verdict::CompileError => "Compile Error",
        Verdict::AssembleError => "Assemble Error",
        Verdict::RuntimeError => "Runtime Error",
        Verdict::TimeLimitExceeded => "Time Limit Exceeded",
        Verdict::InternalError => "Internal Error",
    }
}

fn text_element(writer: &mut Writer<Vec<u8>>, tag: &str, text: &str) -> anyhow::Result<()> {
    writer.write_event(Event::Start(BytesStart::new(tag)))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(BytesEnd::new(tag)))?;
    Ok(())
}

fn link_cell(writer: &mut Writer<Vec<u8>>, target: Option<&str>) -> anyhow::Result<()> {
    writer.write_event(Event::Start(BytesStart::new("td")))?;
    if let Some(target) = target.filter(|t| !t.is_empty()) {
        let href = format!("file://{}", target);
        writer.write_event(Event::Start(
            BytesStart::new("a").with_attributes([("href", href.as_str())]),
        ))?;
        writer.write_event(Event::Text(BytesText::new("view")))?;
        writer.write_event(Event::End(BytesEnd::new("a")))?;
    }
    writer.write_event(Event::End(BytesEnd::new("td")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    #[test]
    fn test_render_escapes_comments() {
        let results = vec![TestCaseResult {
            series: "functional".into(),
            name: "00_main".into(),
            verdict: Verdict::CompileError,
            comment: "expected '<' & got '>'".into(),
            perf: None,
            stdin: PathBuf::from("/cases/00_main.in"),
            stdout: None,
            answer: PathBuf::from("/cases/00_main.out"),
            duration_secs: 1.0,
        }];
        let summary = RunSummary::new("run_1", &results, Duration::from_secs(1));

        let html = render(&results, &summary).unwrap();

        assert!(html.starts_with("<!DOCTYPE html>"));
        assert!(html.contains("<title>run_1</title>"));
        assert!(html.contains("class=\"CE\""));
        assert!(html.contains("&lt;"));
        assert!(!html.contains("'<'"));
        assert!(html.contains("file:///cases/00_main.out"));
    }
}
