//! The crash dump: a human-readable report written when the runtime hits
//! a fatal error. Lists a process-table summary, scheduler states, and
//! memory totals; nothing here allocates from runtime-managed memory.

use std::io::Write;

use ember_rt::process::{status, table};
use ember_rt::scheduler;

/// Renders the report. Split from [`write_crash_dump`] so tests can check
/// the contents without touching the filesystem.
pub fn render() -> String {
    let mut out = String::new();
    let processes = table::snapshot();

    out.push_str("=ember crash dump\n");
    out.push_str(&format!("=processes {}\n", processes.len()));

    let mut total_heap_words = 0usize;
    for process in &processes {
        let bits = process.status().load();
        let state = if bits & status::EXITING != 0 {
            "exiting"
        } else if bits & status::RUNNING != 0 {
            "running"
        } else if bits & status::DIRTY_RUNNING != 0 {
            "dirty-running"
        } else if bits & status::WAITING != 0 {
            "waiting"
        } else {
            "runnable"
        };
        let (heap, mailbox) = match process.try_body() {
            Some(body) => {
                total_heap_words += body.heap.total_words();
                (body.heap.total_words(), body.mailbox.len())
            }
            None => (0, 0),
        };
        let (module, function, arity) = process.initial_call();
        out.push_str(&format!(
            "  {} {} {}:{}/{} heap={}w mailbox={} reductions={}\n",
            process.pid(),
            state,
            module,
            function,
            arity,
            heap,
            mailbox,
            process.reductions(),
        ));
    }

    out.push_str(&format!("=schedulers {}\n", scheduler::scheduler_count()));
    out.push_str(&format!(
        "=memory heap_words={} atoms={}\n",
        total_heap_words,
        ember_rt::term::atom::table_len(),
    ));
    out
}

/// Writes the report next to the current directory; best effort, errors
/// only logged.
pub fn write_crash_dump() {
    let report = render();
    eprintln!("{report}");
    match std::fs::File::create("ember_crash.dump") {
        Ok(mut file) => {
            if let Err(err) = file.write_all(report.as_bytes()) {
                log::error!(target: "runtime", "failed to write crash dump: {err}");
            }
        }
        Err(err) => log::error!(target: "runtime", "failed to create crash dump: {err}"),
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn render_includes_section_headers() {
        let report = super::render();
        assert!(report.contains("=ember crash dump"));
        assert!(report.contains("=processes"));
        assert!(report.contains("=schedulers"));
        assert!(report.contains("=memory"));
    }
}
