//! Framing de linhas sobre um stream de bytes sem delimitação.
//!
//! O dispositivo escreve linhas ASCII terminadas em `\n` ou `\r\n`, mas a
//! porta serial entrega chunks de tamanho arbitrário. O framer guarda o
//! resto parcial até que um chunk posterior complete a linha.
//!
//! ```text
//! bytes ─► Utf8Decoder ─► &str ─► LineFramer ─► linha (sem delimitador)
//! ```

use std::collections::VecDeque;

// ──────────────────────────────────────────────
// Decoder UTF-8 incremental
// ──────────────────────────────────────────────

/// Decodifica chunks de bytes em texto, preservando sequências multi-byte
/// cortadas entre dois chunks. Bytes inválidos viram U+FFFD; nunca falha.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodifica um chunk. Um prefixo incompleto no final fica retido.
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        let mut data = std::mem::take(&mut self.pending);
        data.extend_from_slice(bytes);

        let mut out = String::with_capacity(data.len());
        let mut rest: &[u8] = &data;
        loop {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    out.push_str(s);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&rest[..valid]));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &rest[valid + len..];
                        }
                        // Sequência truncada: espera o próximo chunk
                        None => {
                            rest = &rest[valid..];
                            break;
                        }
                    }
                }
            }
        }

        self.pending = rest.to_vec();
        out
    }

    /// Fim do stream: o que sobrou é decodificado de forma lossy.
    pub fn finish(self) -> String {
        String::from_utf8_lossy(&self.pending).into_owned()
    }
}

// ──────────────────────────────────────────────
// Framer de linhas
// ──────────────────────────────────────────────

/// Divide texto em linhas por `\n`, removendo um `\r` final de cada linha.
///
/// Linhas vazias são repassadas; quem consome decide filtrar.
#[derive(Debug, Default)]
pub struct LineFramer {
    pending: String,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consome um chunk e retorna as linhas completadas por ele.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        let mut frames = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.find('\n') {
            self.pending.push_str(&rest[..pos]);
            let mut line = std::mem::take(&mut self.pending);
            if line.ends_with('\r') {
                line.pop();
            }
            frames.push(line);
            rest = &rest[pos + 1..];
        }

        self.pending.push_str(rest);
        frames
    }

    /// Texto já recebido que ainda não formou uma linha.
    pub fn pending(&self) -> &str {
        &self.pending
    }

    /// Fim do stream: emite o resto não terminado, se houver.
    pub fn finish(self) -> Option<String> {
        let mut tail = self.pending;
        if tail.ends_with('\r') {
            tail.pop();
        }
        (!tail.is_empty()).then_some(tail)
    }
}

/// Iterador preguiçoso de linhas sobre um iterador de chunks de texto.
///
/// Não reinicia: depois de esgotar os chunks e emitir o resto, retorna `None`.
pub struct Frames<I> {
    chunks: I,
    framer: Option<LineFramer>,
    ready: VecDeque<String>,
}

/// Cria um [`Frames`] sobre qualquer coleção de chunks.
pub fn frames<I>(chunks: I) -> Frames<I::IntoIter>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    Frames {
        chunks: chunks.into_iter(),
        framer: Some(LineFramer::new()),
        ready: VecDeque::new(),
    }
}

impl<I> Iterator for Frames<I>
where
    I: Iterator,
    I::Item: AsRef<str>,
{
    type Item = String;

    fn next(&mut self) -> Option<String> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Some(frame);
            }
            let framer = self.framer.as_mut()?;
            match self.chunks.next() {
                Some(chunk) => self.ready.extend(framer.push(chunk.as_ref())),
                None => return self.framer.take().and_then(LineFramer::finish),
            }
        }
    }
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────
