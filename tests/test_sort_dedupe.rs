/*
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! End-to-end tests for the sort and dedupe pipelines, driven through the
//! command-line entry point.

#![cfg(feature = "cli")]

use anyhow::Result;
use flowkit::cli::cli_main;
use flowkit::prelude::*;
use std::path::Path;

fn write_corpus(path: &Path, records: &[FlowRecord]) -> Result<()> {
    let mut writer = RecordWriter::create(
        path,
        &Metadata {
            invocations: vec!["synthetic".into()],
            annotations: vec!["test corpus".into()],
        },
    )?;
    for rec in records {
        writer.write_record(rec)?;
    }
    writer.finish()?;
    Ok(())
}

fn read_corpus(path: &Path) -> Result<Vec<FlowRecord>> {
    RecordReader::open(path)?.collect()
}

fn run(args: &[&str]) -> Result<()> {
    cli_main(std::iter::once("flowkit").chain(args.iter().copied()))
}

#[test]
fn test_sort_by_sport() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let input = dir.path().join("input");
    let output = dir.path().join("output");
    let records: Vec<FlowRecord> = [53u16, 80, 22, 443]
        .into_iter()
        .map(|sport| FlowRecord {
            sport,
            ..Default::default()
        })
        .collect();
    write_corpus(&input, &records)?;
    run(&[
        "sort",
        "--fields",
        "sport",
        input.to_str().unwrap(),
        "-o",
        output.to_str().unwrap(),
    ])?;
    let sports: Vec<u16> = read_corpus(&output)?.iter().map(|r| r.sport).collect();
    assert_eq!(sports, vec![22, 53, 80, 443]);
    Ok(())
}

#[test]
fn test_sort_copies_and_appends_metadata() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let input = dir.path().join("input");
    let output = dir.path().join("output");
    write_corpus(&input, &[FlowRecord::default()])?;
    run(&[
        "sort",
        "--fields",
        "sip",
        "--note-add",
        "sorted for test",
        input.to_str().unwrap(),
        "-o",
        output.to_str().unwrap(),
    ])?;
    let reader = RecordReader::open(&output)?;
    assert_eq!(reader.metadata().invocations.len(), 2);
    assert!(reader.metadata().invocations[0].contains("synthetic"));
    assert!(reader
        .metadata()
        .annotations
        .contains(&"sorted for test".to_owned()));
    Ok(())
}

#[test]
fn test_sort_strip_metadata() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let input = dir.path().join("input");
    let output = dir.path().join("output");
    write_corpus(&input, &[FlowRecord::default()])?;
    run(&[
        "sort",
        "--fields",
        "sip",
        "--notes-strip",
        "--invocation-strip",
        input.to_str().unwrap(),
        "-o",
        output.to_str().unwrap(),
    ])?;
    let reader = RecordReader::open(&output)?;
    // The input's invocation survives; only this invocation is withheld.
    assert_eq!(reader.metadata().invocations.len(), 1);
    assert!(reader.metadata().annotations.is_empty());
    Ok(())
}

#[test]
fn test_sort_empty_input_has_valid_header() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let input = dir.path().join("input");
    let output = dir.path().join("output");
    write_corpus(&input, &[])?;
    run(&[
        "sort",
        "--fields",
        "sip,dip",
        input.to_str().unwrap(),
        "-o",
        output.to_str().unwrap(),
    ])?;
    assert!(read_corpus(&output)?.is_empty());
    Ok(())
}

#[test]
fn test_sort_then_presorted_merge_is_idempotent() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let input = dir.path().join("input");
    let once = dir.path().join("once");
    let twice = dir.path().join("twice");
    let records: Vec<FlowRecord> = (0..500u32)
        .map(|i| FlowRecord {
            sport: (i.wrapping_mul(2654435761) >> 16) as u16,
            dport: (i % 7) as u16,
            ..Default::default()
        })
        .collect();
    write_corpus(&input, &records)?;
    run(&[
        "sort",
        "--fields",
        "sport,dport",
        "--invocation-strip",
        "--buffer-size",
        "8ki",
        input.to_str().unwrap(),
        "-o",
        once.to_str().unwrap(),
    ])?;
    run(&[
        "sort",
        "--fields",
        "sport,dport",
        "--invocation-strip",
        "--presorted-input",
        once.to_str().unwrap(),
        "-o",
        twice.to_str().unwrap(),
    ])?;
    let first = read_corpus(&once)?;
    let second = read_corpus(&twice)?;
    assert_eq!(first, second);
    Ok(())
}

#[test]
fn test_dedupe_stime_tolerance() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let input = dir.path().join("input");
    let output = dir.path().join("output");
    let base = FlowRecord {
        sport: 4242,
        stime_ms: 1_700_000_000_000,
        ..Default::default()
    };
    let near = FlowRecord {
        stime_ms: base.stime_ms + 3,
        ..base.clone()
    };
    write_corpus(&input, &[base.clone(), near])?;
    run(&[
        "dedupe",
        "--stime-delta",
        "5",
        input.to_str().unwrap(),
        "-o",
        output.to_str().unwrap(),
    ])?;
    let records = read_corpus(&output)?;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0], base);
    Ok(())
}

#[test]
fn test_dedupe_output_has_no_adjacent_duplicates() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let input = dir.path().join("input");
    let output = dir.path().join("output");
    let mut records = Vec::new();
    for i in 0..50u16 {
        let rec = FlowRecord {
            sport: i % 10,
            dport: i % 3,
            ..Default::default()
        };
        records.push(rec.clone());
        records.push(rec);
    }
    write_corpus(&input, &records)?;
    run(&[
        "dedupe",
        input.to_str().unwrap(),
        "-o",
        output.to_str().unwrap(),
    ])?;
    let kept = read_corpus(&output)?;
    // 10 × 3 distinct (sport, dport) combinations appear in the input.
    let distinct: std::collections::HashSet<(u16, u16)> =
        kept.iter().map(|r| (r.sport, r.dport)).collect();
    assert_eq!(kept.len(), distinct.len());
    for pair in kept.windows(2) {
        assert_ne!(pair[0], pair[1]);
    }
    Ok(())
}

#[test]
fn test_dedupe_single_record() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let input = dir.path().join("input");
    let output = dir.path().join("output");
    write_corpus(&input, &[FlowRecord::default()])?;
    run(&[
        "dedupe",
        input.to_str().unwrap(),
        "-o",
        output.to_str().unwrap(),
    ])?;
    assert_eq!(read_corpus(&output)?.len(), 1);
    Ok(())
}

#[test]
fn test_sort_rejects_unknown_field() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let input = dir.path().join("input");
    write_corpus(&input, &[])?;
    assert!(run(&["sort", "--fields", "nonsense", input.to_str().unwrap()]).is_err());
    Ok(())
}
