use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use uanet::{Error, EventLoop, EventSource, EventSourceState, InterruptManager};

// Signal dispositions and the self-pipe statics are process-global, so
// everything lives in one test function.
#[test]
fn signals_become_loop_callbacks_and_coalesce() {
    let el = EventLoop::new();
    let im = InterruptManager::new_self_pipe("interrupts");
    el.register_event_source(im.clone()).unwrap();

    let count = Arc::new(AtomicU32::new(0));
    let counter = count.clone();
    im.register_interrupt(libc::SIGUSR1, move |signal| {
        assert_eq!(signal, libc::SIGUSR1);
        counter.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();

    el.start().unwrap();
    assert_eq!(im.state(), EventSourceState::Started);

    // No callback from signal context: the handler only marks and writes
    // the pipe
    unsafe {
        libc::raise(libc::SIGUSR1);
        libc::raise(libc::SIGUSR1);
        libc::raise(libc::SIGUSR1);
    }
    assert_eq!(count.load(Ordering::SeqCst), 0);

    // Consecutive raises between two iterations coalesce into one callback
    el.run(Duration::from_millis(50)).unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 1);

    unsafe {
        libc::raise(libc::SIGUSR1);
    }
    el.run(Duration::from_millis(50)).unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 2);

    // Only one self-pipe manager may be active in the process
    let second_el = EventLoop::new();
    let second = InterruptManager::new_self_pipe("second");
    second_el.register_event_source(second.clone()).unwrap();
    match second_el.start() {
        Err(Error::BadState(_)) => (),
        v => panic!("Unexpected = {:?}", v),
    }
    second_el.stop();

    // Stopping the first manager unwinds its handlers and releases the
    // singleton
    el.stop();
    assert_eq!(im.state(), EventSourceState::Stopped);
    assert_eq!(el.state(), uanet::EventLoopState::Stopped);

    second_el.start().unwrap();
    assert_eq!(second.state(), EventSourceState::Started);
    second_el.stop();
}
