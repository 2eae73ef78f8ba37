use std::time::Instant;

use colored::Colorize;

fn bold_print(msg: &str) {
    println!("{}", msg.bold());
}

pub struct Timer {
    start_time: Instant,
    last_print_time: Instant,
}

impl Timer {
    pub fn new() -> Timer {
        let now = Instant::now();
        Timer { start_time: now, last_print_time: now }
    }

    pub fn lap_secs(&mut self) -> f64 {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_print_time).as_secs_f64();
        self.last_print_time = now;
        elapsed
    }

    pub fn total_secs(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    pub fn print(&mut self) {
        let elapsed = self.lap_secs();
        bold_print(&format!(
            "Timer since last print: {:.3} sec; since creation: {:.3} sec",
            elapsed,
            self.total_secs()
        ));
    }
}

impl Default for Timer {
    fn default() -> Timer {
        Timer::new()
    }
}
