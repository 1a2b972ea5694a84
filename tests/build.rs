use rerun_except::rerun_except;

pub fn main() {
    // Don't rebuild the whole crate when only test inputs change.
    rerun_except(&["bytecode"]).unwrap();
}
