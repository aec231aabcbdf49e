//! Keygen command implementation.

use firemirror_protocol::generate_push_id;

/// Prints `count` push ids, one per line.
pub fn run(count: usize) {
    for id in generate(count) {
        println!("{id}");
    }
}

fn generate(count: usize) -> Vec<String> {
    (0..count).map(|_| generate_push_id()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use firemirror_protocol::is_push_id;

    #[test]
    fn ids_are_valid_and_ordered() {
        let ids = generate(50);
        assert_eq!(ids.len(), 50);
        assert!(ids.iter().all(|id| is_push_id(id)));
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
    }
}
