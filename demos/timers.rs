use std::time::Duration;

use mordor::Scheduler;

fn main() {
    env_logger::init();

    let scheduler = Scheduler::single();
    let ticks = Duration::from_millis(50).as_nanos() as u64;

    let count = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let count_for_timer = count.clone();
    let recurring = scheduler.register_timer(
        ticks,
        move || {
            let n = count_for_timer.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
            println!("tick {n}");
        },
        true,
    );

    let scheduler_for_stop = scheduler.clone();
    let _one_shot = scheduler.register_timer(
        ticks * 5,
        move || {
            println!("five ticks elapsed, stopping");
            recurring.cancel();
            scheduler_for_stop.stop();
        },
        false,
    );

    scheduler.dispatch();
}
