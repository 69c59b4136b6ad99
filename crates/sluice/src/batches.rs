//! Batch sizing helpers for staging-database round trips.

/// Default number of mutations per staging statement. Large enough to
/// amortize round trips, small enough to stay under read-buffer limits on
/// the staging database.
pub const SIZE: usize = 1_000;

/// Invokes `f(begin, end)` over consecutive windows of at most `size`
/// elements covering `0..len`.
pub fn window<E>(size: usize, len: usize, mut f: impl FnMut(usize, usize) -> Result<(), E>) -> Result<(), E> {
    assert!(size > 0, "window size must be positive");
    let mut begin = 0;
    while begin < len {
        let end = (begin + size).min(len);
        f(begin, end)?;
        begin = end;
    }
    Ok(())
}

/// [`window`] with the default batch [`SIZE`].
pub fn batch<E>(len: usize, f: impl FnMut(usize, usize) -> Result<(), E>) -> Result<(), E> {
    window(SIZE, len, f)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_cover_the_input() {
        let mut seen = Vec::new();
        window::<()>(10, 25, |begin, end| {
            seen.push((begin, end));
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![(0, 10), (10, 20), (20, 25)]);
    }

    #[test]
    fn empty_input_makes_no_calls() {
        window::<()>(10, 0, |_, _| panic!("no calls expected")).unwrap();
    }

    #[test]
    fn errors_stop_iteration() {
        let mut calls = 0;
        let result = window(1, 5, |_, _| {
            calls += 1;
            if calls == 2 {
                Err("stop")
            } else {
                Ok(())
            }
        });
        assert_eq!(result, Err("stop"));
        assert_eq!(calls, 2);
    }
}
