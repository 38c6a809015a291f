fn main() {
    println!("Run `cargo test -p wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;
    use std::sync::Arc;

    use flowfile_protocol::{
        Attributes, ReadAt, Scanner, StreamingFile, read_file, read_file_at, write_file,
    };
    use serde::Deserialize;
    use tokio::io::AsyncReadExt;

    #[derive(Debug, Deserialize)]
    struct Fixtures {
        records: Vec<RecordFixture>,
        streams: Vec<StreamFixture>,
    }

    #[derive(Debug, Deserialize)]
    struct RecordFixture {
        name: String,
        attributes: Vec<(String, String)>,
        content_hex: String,
        wire_hex: String,
    }

    #[derive(Debug, Deserialize)]
    struct StreamFixture {
        name: String,
        records: Vec<String>,
        wire_hex: String,
    }

    impl RecordFixture {
        fn content(&self) -> Vec<u8> {
            hex::decode(&self.content_hex).unwrap()
        }

        fn wire(&self) -> Vec<u8> {
            hex::decode(&self.wire_hex).unwrap()
        }

        fn attrs(&self) -> Attributes {
            self.attributes.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect()
        }

        fn file(&self) -> StreamingFile {
            StreamingFile::from_bytes(self.content()).with_attributes(self.attrs())
        }
    }

    /// Returns the path to the fixtures directory.
    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    fn load_fixtures() -> Fixtures {
        let path = fixtures_dir().join("records.json");
        let data = fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()));
        serde_json::from_str(&data)
            .unwrap_or_else(|e| panic!("failed to parse fixture {}: {e}", path.display()))
    }

    fn pairs(attrs: &Attributes) -> Vec<(String, String)> {
        attrs
            .iter()
            .map(|a| (a.name.clone(), a.value.clone()))
            .collect()
    }

    async fn read_all(file: &mut StreamingFile) -> Vec<u8> {
        let mut content = Vec::new();
        file.read_to_end(&mut content).await.unwrap();
        content
    }

    #[tokio::test]
    async fn reference_record_bytes() {
        let mut file = StreamingFile::from_bytes(&b"this is a custom string for flowfile"[..]);
        file.attrs_mut()
            .set("path", "./")
            .set("filename", "abcd-efgh");

        let mut wire = Vec::new();
        write_file(&mut wire, &mut file).await.unwrap();

        let expected: &[u8] = b"NiFiFF3\x00\x02\x00\x04path\x00\x02./\x00\x08filename\x00\x09abcd-efgh\
            \x00\x00\x00\x00\x00\x00\x00\x24this is a custom string for flowfile";
        assert_eq!(wire, expected);
    }

    #[tokio::test]
    async fn encoding_matches_fixtures() {
        for fixture in load_fixtures().records {
            let mut wire = Vec::new();
            write_file(&mut wire, &mut fixture.file()).await.unwrap();
            assert_eq!(
                hex::encode(&wire),
                fixture.wire_hex,
                "encoding mismatch for {}",
                fixture.name
            );
        }
    }

    #[tokio::test]
    async fn stream_decoding_matches_fixtures() {
        for fixture in load_fixtures().records {
            let mut file = read_file(std::io::Cursor::new(fixture.wire()))
                .await
                .unwrap()
                .unwrap_or_else(|| panic!("no record decoded for {}", fixture.name));
            assert_eq!(pairs(file.attrs()), fixture.attributes, "{}", fixture.name);
            assert_eq!(file.size(), fixture.content().len() as u64, "{}", fixture.name);
            assert_eq!(read_all(&mut file).await, fixture.content(), "{}", fixture.name);
        }
    }

    #[tokio::test]
    async fn random_access_decoding_matches_fixtures() {
        for fixture in load_fixtures().records {
            let source: Arc<dyn ReadAt> = Arc::new(fixture.wire());
            let mut file = read_file_at(source, 0).await.unwrap().unwrap();
            assert_eq!(pairs(file.attrs()), fixture.attributes, "{}", fixture.name);
            assert_eq!(read_all(&mut file).await, fixture.content(), "{}", fixture.name);

            file.reset().unwrap();
            assert_eq!(read_all(&mut file).await, fixture.content(), "{}", fixture.name);
        }
    }

    #[tokio::test]
    async fn streams_yield_records_in_order() {
        let fixtures = load_fixtures();
        for stream in &fixtures.streams {
            let expected: Vec<&RecordFixture> = stream
                .records
                .iter()
                .map(|name| {
                    fixtures
                        .records
                        .iter()
                        .find(|r| &r.name == name)
                        .unwrap_or_else(|| panic!("unknown record {name}"))
                })
                .collect();

            let mut scanner = Scanner::new(std::io::Cursor::new(hex::decode(&stream.wire_hex).unwrap()));
            let mut seen = 0;
            while scanner.scan().await {
                let file = scanner.file().unwrap();
                let record = expected[seen];
                assert_eq!(pairs(file.attrs()), record.attributes, "{}", stream.name);
                assert_eq!(read_all(file).await, record.content(), "{}", stream.name);
                seen += 1;
            }
            assert!(scanner.err().is_none(), "{}: {:?}", stream.name, scanner.err());
            assert_eq!(scanner.finish().await.unwrap(), expected.len() as u64);
            assert_eq!(seen, expected.len(), "{}", stream.name);
        }
    }

    #[tokio::test]
    async fn unread_content_is_skipped() {
        let fixtures = load_fixtures();
        let stream = fixtures
            .streams
            .iter()
            .find(|s| s.name == "two_records")
            .unwrap();

        let mut scanner = Scanner::new(std::io::Cursor::new(hex::decode(&stream.wire_hex).unwrap()));
        let mut names = Vec::new();
        while scanner.scan().await {
            let file = scanner.file().unwrap();
            names.push(file.attrs().get("filename").unwrap_or_default().to_string());
        }
        assert_eq!(names, ["abcd-efgh", "empty.txt"]);
        assert!(scanner.err().is_none());
    }

    #[test]
    fn json_diagnostics_keep_wire_order() {
        for fixture in load_fixtures().records {
            let json: serde_json::Value = serde_json::from_str(&fixture.attrs().to_json().unwrap()).unwrap();
            let expected: Vec<serde_json::Value> = fixture
                .attributes
                .iter()
                .map(|(name, value)| serde_json::json!({ "name": name, "value": value }))
                .collect();
            assert_eq!(json, serde_json::Value::Array(expected), "{}", fixture.name);
        }
    }
}
