//! Interactive session: a console loop that parses commands, adjusts
//! settings, and runs queries against the loaded heap.

use std::io::{self, BufRead, Write};

use crate::commands::{parse_command, Command, ThresholdDim};
use crate::heap::Heap;
use crate::histo::Histo;
use crate::search::search_heap;

pub struct Session {
    heap: Heap,
    threshold: Option<(u64, ThresholdDim)>,
}

impl Session {
    pub fn new(heap: Heap) -> Session {
        Session {
            heap,
            threshold: None,
        }
    }

    pub fn threshold(&self) -> Option<(u64, ThresholdDim)> {
        self.threshold
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Run the console until EOF.
    pub fn interact(&mut self) -> io::Result<()> {
        let stdin = io::stdin();
        let mut lines = stdin.lock().lines();
        loop {
            print!("> ");
            io::stdout().flush()?;
            let line = match lines.next() {
                Some(line) => line?,
                None => return Ok(()),
            };
            if line.trim().is_empty() {
                continue;
            }
            self.run(&line);
        }
    }

    /// Execute one console command. User errors are printed and the
    /// session continues.
    pub fn run(&mut self, line: &str) {
        match parse_command(line) {
            Ok(command) => self.dispatch(command),
            Err(err) => println!("{}", err),
        }
    }

    fn dispatch(&mut self, command: Command) {
        match command {
            Command::Histo(query) => {
                let mut histo = Histo::new(&self.heap);
                search_heap(&self.heap, &query, &mut histo);
                let mut stdout = io::stdout();
                if let Err(err) = histo.print(&mut stdout, self.threshold) {
                    eprintln!("cannot write histogram: {}", err);
                }
            }
            Command::SetThreshold { value, dim } => self.threshold = Some((value, dim)),
            Command::SetNoThreshold => self.threshold = None,
            Command::SetGarbage(mode) => self.heap.roots.set_visibility(mode),
            Command::SetSkip { pattern, skip } => {
                if !self.heap.do_skip(&pattern, skip) {
                    println!("No classes match {}", pattern);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::Field;
    use crate::gcroots::Visibility;
    use crate::refbag::RefBag;
    use crate::IdSize;

    fn build_session() -> Session {
        let mut heap = Heap::new(IdSize::U64).unwrap();
        heap.add_class("java/lang/Object", 0x10, 0, vec![], vec![])
            .unwrap();
        let thing = heap
            .add_class(
                "com/acme/Thing",
                0x11,
                0x10,
                vec![Field::new("next".into(), true, 8, 0)],
                vec![],
            )
            .unwrap();
        heap.add_instance(0x100, &thing, 16).unwrap();
        heap.post_process(Some(vec![RefBag::new()])).unwrap();
        Session::new(heap)
    }

    #[test]
    fn settings_commands_update_state() {
        let mut session = build_session();
        assert_eq!(None, session.threshold());
        assert_eq!(Visibility::Live, session.heap().roots.visibility());

        session.run("set threshold 100k bytes");
        assert_eq!(Some((102_400, ThresholdDim::Bytes)), session.threshold());

        session.run("set nothreshold");
        assert_eq!(None, session.threshold());

        session.run("set garbage only");
        assert_eq!(Visibility::NonLive, session.heap().roots.visibility());

        session.run("set nogarbage");
        assert_eq!(Visibility::Live, session.heap().roots.visibility());
    }

    #[test]
    fn skip_commands_mark_classes() {
        let mut session = build_session();
        let cid = session
            .heap()
            .classes
            .by_name("com.acme.Thing")
            .unwrap()
            .cid();

        session.run("set skip com.acme.*");
        assert!(session.heap().is_skipped(cid));

        session.run("set noskip com.acme.Thing");
        assert!(!session.heap().is_skipped(cid));

        session.run("set noskip none");
        assert!(session.heap().is_skipped(cid));

        session.run("set skip none");
        assert!(!session.heap().is_skipped(cid));
    }

    #[test]
    fn bad_commands_do_not_disturb_the_session() {
        let mut session = build_session();
        session.run("set threshold whenever");
        session.run("histo q of com.acme.Thing x");
        session.run("histo x of com.acme.Thing x"); // prints an empty histogram
        assert_eq!(None, session.threshold());
    }
}
