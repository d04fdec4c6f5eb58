use mordor::Fiber;

fn main() {
    env_logger::init();

    // Spawn a new fiber, still in Hold.
    let coro = Fiber::spawn(move || {
        println!("1. Hello in fiber!");

        // Yield back to whoever called us.
        Fiber::yield_now();

        println!("3. We are back!!");

        // Spawn a child fiber and drive it to completion, one `call` per
        // `yield_now` it performs along the way.
        let counter = Fiber::spawn(move || {
            println!("4. Begin counting ...");
            for i in 0..5 {
                println!("Counting {i}");
                Fiber::yield_now();
            }
            println!("5. Counting finished");
        });
        while !counter.is_finished() {
            counter.call().expect("counting fiber panicked");
        }

        println!("6. Good bye");
    });

    coro.call().expect("call failed");
    println!("2. We are here!");

    coro.call().expect("call failed");
    println!("7. Back to main.");
}
