//! Pipelines built from descriptions and from custom stage types

use flowgraph::prelude::*;
use flowgraph::record::{self, KeyDistribution, RECORD_LEN};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const SORT_FILE: &str = "\
# sort one file
stage read-file reader
stage sort sorter
stage write-file writer
connect reader.data_out sorter.data_in
connect sorter.data_out writer.data_in
set_bufsize default 1024
";

#[test]
fn test_duplicate_outlives_original() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in");
    let mut rng = StdRng::seed_from_u64(5);
    record::write_records(&input, &record::generate(&mut rng, KeyDistribution::Uniform, 100)).unwrap();

    let registry = Registry::builtin();
    let mut original = config::load_str(&registry, "orig", SORT_FILE).unwrap();
    original.alias_param("reader", "filename", "input").unwrap();
    original.set_param("input", input.display().to_string()).unwrap();
    original.set_param("writer.filename", dir.path().join("a").display().to_string()).unwrap();

    let mut copy = original.duplicate("copy").unwrap();
    assert_eq!(copy.stages().len(), original.stages().len());
    assert_eq!(copy.connections(), original.connections());
    assert_eq!(copy.aliases(), original.aliases());
    drop(original);

    copy.set_param("writer.filename", dir.path().join("b").display().to_string()).unwrap();
    copy.fix().unwrap();
    copy.run().unwrap();

    let mut rerun = config::load_str(&registry, "again", SORT_FILE).unwrap();
    rerun.set_param("reader.filename", input.display().to_string()).unwrap();
    rerun.set_param("writer.filename", dir.path().join("a").display().to_string()).unwrap();
    rerun.fix().unwrap();
    rerun.run().unwrap();

    let a = std::fs::read(dir.path().join("a")).unwrap();
    let b = std::fs::read(dir.path().join("b")).unwrap();
    assert_eq!(a.len(), 100 * RECORD_LEN);
    assert_eq!(a, b);
}

#[test]
fn test_bad_description_reports_line() {
    let registry = Registry::builtin();
    let text = "stage read-file r\n\nstage write-file w\nconnect r.data_out w.nope\n";
    match config::load_str(&registry, "bad", text) {
        Err(Error::Config { line, .. }) => assert_eq!(line, 4),
        other => panic!("unexpected {:?}", other.map(|_| ())),
    }
    assert!(config::load_str(&registry, "bad", "stage quicksort q\n").is_err());
    assert!(config::load_str(&registry, "bad", "frobnicate\n").is_err());
}

/// Counts buffers and passes them through unchanged
struct Tally {
    seen: Arc<AtomicUsize>,
}

impl StageLogic for Tally {
    fn step(&mut self, io: &StageIo<'_>) -> Result<Step> {
        let Some(buf) = io.input("data_in")?.accept() else {
            return Ok(Step::Terminate);
        };
        self.seen.fetch_add(1, Ordering::SeqCst);
        io.output("data_out")?.convey(buf)?;
        Ok(Step::Continue)
    }
}

#[test]
fn test_custom_stage_type() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in");
    std::fs::write(&input, vec![1u8; 1000]).unwrap();

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    let mut registry = Registry::builtin();
    registry
        .register(
            StageDef::new("tally", move |_| {
                Ok(Box::new(Tally {
                    seen: Arc::clone(&counter),
                }) as Box<dyn StageLogic>)
            })
            .with_doc("counts buffers")
            .with_pins(&[PinDecl::input("data_in"), PinDecl::output("data_out")]),
        )
        .unwrap();
    assert!(registry.register(StageDef::new("tally", |_| Err(Error::QueueDeactivated))).is_err());

    let text = format!(
        "stage read-file r\nstage tally t\nstage write-file w\n\
         set r.filename {}\nset w.filename {}\n\
         connect r.data_out t.data_in\nconnect t.data_out w.data_in\n\
         set_bufsize default 100\nset_bufcount default 2\n",
        input.display(),
        dir.path().join("out").display()
    );
    let mut nw = config::load_str(&registry, "tally", &text).unwrap();
    nw.fix().unwrap();
    nw.run().unwrap();

    assert_eq!(seen.load(Ordering::SeqCst), 10);
    assert_eq!(std::fs::read(dir.path().join("out")).unwrap().len(), 1000);
}

#[test]
fn test_description_file_with_loops() {
    let dir = tempfile::tempdir().unwrap();
    for i in 0..3 {
        std::fs::write(dir.path().join(format!("part-{}", i)), vec![i as u8; 40]).unwrap();
    }
    let desc = dir.path().join("combine.fg");
    std::fs::write(
        &desc,
        format!(
            "stage rr-combine c\nstage write-file w\nset w.filename {dir}/all\n\
             connect c.data_out w.data_in\n\
             loop 3 stage read-file r$\n\
             loop 3 set r$.filename {dir}/part-$\n\
             loop 3 connect r$.data_out c.data_in\n",
            dir = dir.path().display()
        ),
    )
    .unwrap();

    let mut nw = config::load_file(&Registry::builtin(), "combine", &desc).unwrap();
    assert_eq!(nw.stages().len(), 5);
    nw.fix().unwrap();
    nw.run().unwrap();

    let mut all = std::fs::read(dir.path().join("all")).unwrap();
    all.sort();
    let mut expected: Vec<u8> = (0..3u8).flat_map(|i| vec![i; 40]).collect();
    expected.sort();
    assert_eq!(all, expected);
}

#[cfg(target_os = "linux")]
#[test]
fn test_failed_write_ends_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in");
    std::fs::write(&input, vec![1u8; 64 * 1024]).unwrap();

    let text = format!(
        "stage read-file reader\n\
         stage write-file writer\n\
         set reader.filename {}\n\
         set writer.filename /dev/full\n\
         connect reader.data_out writer.data_in\n\
         set_bufsize default 4096\n\
         set_bufcount default 2\n",
        input.display()
    );
    let mut nw = config::load_str(&Registry::builtin(), "full", &text).unwrap();
    nw.fix().unwrap();

    // The reader's pool is left inside the failed writer; the run must
    // still return the writer's error rather than block.
    match nw.run() {
        Err(Error::StageFailed { stage, source }) => {
            assert_eq!(stage, "writer");
            assert!(matches!(*source, Error::File { .. }));
        }
        other => panic!("unexpected result: {:?}", other),
    }
}
