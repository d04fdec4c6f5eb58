use mordor::parallel::parallel_foreach;
use mordor::Scheduler;

fn main() {
    env_logger::init();

    let workers = num_cpus::get();
    let scheduler = Scheduler::new(workers, true);

    scheduler
        .schedule(
            move || {
                let ok = parallel_foreach(
                    0..workers,
                    |thread_id| {
                        for count in 0..10 {
                            println!("Coroutine running on worker {thread_id}: counting {count}");
                        }
                        true
                    },
                    workers,
                )
                .expect("a worker panicked");
                assert!(ok);
            },
            None,
        )
        .unwrap();

    scheduler.stop();
}
