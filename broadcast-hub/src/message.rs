//! Text the hub puts on the wire.
//!
//! Frames are plain text with no envelope; payloads are relayed verbatim.

pub fn join_notice(client_id: &str) -> String {
    format!("{client_id} joined")
}

pub fn chat_line(client_id: &str, payload: &str) -> String {
    format!("[{client_id}]: {payload}")
}

pub fn leave_notice(client_id: &str) -> String {
    format!("{client_id} left")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notices_name_the_client() {
        assert_eq!(join_notice("alice"), "alice joined");
        assert_eq!(leave_notice("bob"), "bob left");
    }

    #[test]
    fn chat_line_keeps_payload_verbatim() {
        assert_eq!(chat_line("alice", "hi"), "[alice]: hi");
        assert_eq!(chat_line("alice", ""), "[alice]: ");
        assert_eq!(chat_line("a b", " {\"x\": 1}\n"), "[a b]:  {\"x\": 1}\n");
    }
}
