//! Incremental detokenization for streamed output.
//!
//! Byte-level BPE vocabularies split multi-byte characters (CJK in
//! particular) across tokens, so a token decoded on its own may be half a
//! character. The decoder re-decodes the pending window and only emits text
//! once it ends on a complete character.

use tokenizers::Tokenizer;

use crate::error::NativeError;

const REPLACEMENT: char = '\u{FFFD}';

pub(crate) trait PieceDecoder {
    fn decode_ids(&self, ids: &[u32]) -> Result<String, NativeError>;
}

impl PieceDecoder for Tokenizer {
    fn decode_ids(&self, ids: &[u32]) -> Result<String, NativeError> {
        self.decode(ids, false)
            .map_err(|e| NativeError::call("decode", e.to_string()))
    }
}

pub(crate) struct StreamDecoder<'d, D: PieceDecoder + ?Sized> {
    decoder: &'d D,
    tokens: Vec<u32>,
    prev_index: usize,
    current_index: usize,
}

impl<'d, D: PieceDecoder + ?Sized> StreamDecoder<'d, D> {
    pub(crate) fn new(decoder: &'d D) -> Self {
        Self {
            decoder,
            tokens: Vec::new(),
            prev_index: 0,
            current_index: 0,
        }
    }

    /// Text completed by `token`, if any.
    pub(crate) fn next_token(&mut self, token: u32) -> Result<Option<String>, NativeError> {
        let prev_text = self.decode_window(self.prev_index, self.current_index)?;
        self.tokens.push(token);
        let text = self.decode_window(self.prev_index, self.tokens.len())?;

        if text.len() <= prev_text.len() || text.ends_with(REPLACEMENT) {
            return Ok(None);
        }
        let Some(delta) = text.get(prev_text.len()..) else {
            return Ok(None);
        };
        let delta = delta.to_string();
        self.prev_index = self.current_index;
        self.current_index = self.tokens.len();
        Ok(Some(delta))
    }

    /// Whatever is still pending, complete or not.
    pub(crate) fn flush(&mut self) -> Result<Option<String>, NativeError> {
        let prev_text = self.decode_window(self.prev_index, self.current_index)?;
        let text = self.decode_window(self.prev_index, self.tokens.len())?;
        self.prev_index = self.tokens.len();
        self.current_index = self.tokens.len();

        match text.get(prev_text.len()..) {
            Some(rest) if !rest.is_empty() => Ok(Some(rest.to_string())),
            _ => Ok(None),
        }
    }

    /// Drops pending tokens that never formed a complete character.
    pub(crate) fn discard_pending(&mut self) {
        self.tokens.truncate(self.current_index);
    }

    fn decode_window(&self, from: usize, to: usize) -> Result<String, NativeError> {
        if from >= to {
            return Ok(String::new());
        }
        self.decoder.decode_ids(&self.tokens[from..to])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Each id is one raw byte, decoded lossily like a byte-level vocabulary.
    struct ByteVocab;

    impl PieceDecoder for ByteVocab {
        fn decode_ids(&self, ids: &[u32]) -> Result<String, NativeError> {
            let bytes: Vec<u8> = ids.iter().map(|&id| id as u8).collect();
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }
    }

    fn ids(text: &str) -> Vec<u32> {
        text.bytes().map(u32::from).collect()
    }

    fn stream(text: &str) -> Vec<String> {
        let vocab = ByteVocab;
        let mut decoder = StreamDecoder::new(&vocab);
        let mut out = Vec::new();
        for id in ids(text) {
            if let Some(piece) = decoder.next_token(id).expect("decode") {
                out.push(piece);
            }
        }
        if let Some(rest) = decoder.flush().expect("flush") {
            out.push(rest);
        }
        out
    }

    #[test]
    fn split_cjk_characters_are_held_until_complete() {
        let pieces = stream("你好");
        assert_eq!(pieces, vec!["你".to_string(), "好".to_string()]);
        assert!(pieces.iter().all(|p| !p.contains(REPLACEMENT)));
    }

    #[test]
    fn ascii_streams_one_piece_per_token() {
        assert_eq!(stream("ok"), vec!["o".to_string(), "k".to_string()]);
    }

    #[test]
    fn mixed_text_reassembles_exactly() {
        let text = "台北 101 很高!";
        assert_eq!(stream(text).concat(), text);
    }

    #[test]
    fn incomplete_tail_can_be_discarded() {
        let vocab = ByteVocab;
        let mut decoder = StreamDecoder::new(&vocab);
        assert_eq!(decoder.next_token(b'a' as u32).expect("a"), Some("a".to_string()));
        let partial = ids("好");
        assert_eq!(decoder.next_token(partial[0]).expect("lead byte"), None);

        decoder.discard_pending();
        assert_eq!(decoder.flush().expect("flush"), None);
    }
}
