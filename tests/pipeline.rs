//! End-to-end scenarios over synthetic in-memory documents.

use vellum::render::page::RenderFlags;
use vellum::render::{BitmapFormat, Color};
use vellum::{open, Document, FileKind};

/// Assembles a classic-xref PDF from numbered object bodies.
fn build_pdf(bodies: &[(u32, Vec<u8>)], trailer_extra: &str) -> Vec<u8> {
    let mut data = b"%PDF-1.4\n".to_vec();
    let mut offsets = Vec::new();
    for (nr, body) in bodies {
        offsets.push((*nr, data.len()));
        data.extend_from_slice(format!("{} 0 obj\n", nr).as_bytes());
        data.extend_from_slice(body);
        data.extend_from_slice(b"\nendobj\n");
    }
    let xref_pos = data.len();
    let max_nr = bodies.iter().map(|&(nr, _)| nr).max().unwrap_or(0);
    data.extend_from_slice(format!("xref\n0 {}\n", max_nr + 1).as_bytes());
    data.extend_from_slice(b"0000000000 65535 f \n");
    for nr in 1..=max_nr {
        match offsets.iter().find(|&&(n, _)| n == nr) {
            Some(&(_, off)) => data.extend_from_slice(format!("{:010} 00000 n \n", off).as_bytes()),
            None => data.extend_from_slice(b"0000000000 65535 f \n"),
        }
    }
    data.extend_from_slice(
        format!(
            "trailer\n<</Size {} {}>>\nstartxref\n{}\n%%EOF",
            max_nr + 1,
            trailer_extra,
            xref_pos
        )
        .as_bytes(),
    );
    data
}

fn stream_obj(dict_extra: &str, payload: &[u8]) -> Vec<u8> {
    let mut body = format!("<</Length {}{}>>\nstream\n", payload.len(), dict_extra).into_bytes();
    body.extend_from_slice(payload);
    body.extend_from_slice(b"\nendstream");
    body
}

fn hello_pdf() -> Vec<u8> {
    let contents = b"BT /F1 12 Tf 100 700 Td (Hello) Tj ET";
    build_pdf(
        &[
            (1, b"<</Type/Catalog/Pages 2 0 R>>".to_vec()),
            (2, b"<</Type/Pages/Kids[3 0 R]/Count 1>>".to_vec()),
            (
                3,
                b"<</Type/Page/Parent 2 0 R/MediaBox[0 0 612 792]/Resources<</Font<</F1 5 0 R>>>>/Contents 4 0 R>>"
                    .to_vec(),
            ),
            (4, stream_obj("", contents)),
            (5, b"<</Type/Font/Subtype/Type1/BaseFont/Helvetica>>".to_vec()),
        ],
        "/Root 1 0 R",
    )
}

#[test]
fn s1_hello_document_opens_and_renders() {
    let doc = match open(hello_pdf(), b"").unwrap() {
        FileKind::Pdf(doc) => doc,
        _ => panic!("expected a PDF"),
    };
    assert_eq!(doc.version(), "1.4");
    assert_eq!(doc.page_count(), 1);

    let layout = doc.page_layout(0).unwrap();
    assert_eq!(layout.width_points, 612.0);
    assert_eq!(layout.height_points, 792.0);
    assert_eq!(layout.rotation, 0);
    assert_eq!(layout.media_box, [0.0, 0.0, 612.0, 792.0]);

    let bmp = doc
        .render_page(0, 100, 130, Color::WHITE, RenderFlags::empty())
        .unwrap();
    assert_eq!((bmp.width(), bmp.height()), (100, 130));
    assert_eq!(bmp.format(), BitmapFormat::Bgra);
    assert_eq!(bmp.pitch() % 4, 0);
    let px = bmp.get_pixel(0, 0).unwrap();
    assert_eq!((px.r, px.g, px.b, px.a), (255, 255, 255, 255));

    // out of range index
    assert!(doc.render_page(1, 10, 10, Color::WHITE, RenderFlags::empty()).is_none());
}

#[test]
fn s1_fill_reaches_pixels() {
    // a red rectangle covering the lower-left quadrant
    let contents = b"1 0 0 rg 0 0 306 396 re f";
    let pdf = build_pdf(
        &[
            (1, b"<</Type/Catalog/Pages 2 0 R>>".to_vec()),
            (2, b"<</Type/Pages/Kids[3 0 R]/Count 1>>".to_vec()),
            (
                3,
                b"<</Type/Page/Parent 2 0 R/MediaBox[0 0 612 792]/Contents 4 0 R>>".to_vec(),
            ),
            (4, stream_obj("", contents)),
        ],
        "/Root 1 0 R",
    );
    let doc = Document::load(pdf, b"").unwrap();
    let bmp = doc
        .render_page(0, 100, 100, Color::WHITE, RenderFlags::empty())
        .unwrap();
    // lower-left quadrant is red, top-left stays white
    let p = bmp.get_pixel(10, 90).unwrap();
    assert_eq!((p.r, p.g, p.b), (255, 0, 0));
    let p = bmp.get_pixel(10, 10).unwrap();
    assert_eq!((p.r, p.g, p.b), (255, 255, 255));

    // grayscale rendering honors the flag
    let gray = doc
        .render_page(0, 100, 100, Color::WHITE, RenderFlags::GRAYSCALE)
        .unwrap();
    assert_eq!(gray.format(), BitmapFormat::Gray);
    let p = gray.get_pixel(10, 90).unwrap();
    assert!(p.r < 150 && p.r > 30, "red maps to mid gray, got {}", p.r);
}

#[test]
fn s2_jpeg_solid_red() {
    // decoded through the standalone image surface
    let jpeg = jpeg_fixture_solid_red();
    match open(jpeg, b"").unwrap() {
        FileKind::Image(img) => {
            assert_eq!((img.width(), img.height()), (16, 16));
            let rgb = img.to_rgb();
            assert_eq!(rgb.len(), 16 * 16 * 3);
            for px in rgb.chunks(3) {
                assert!(px[0] >= 253, "{:?}", px);
                assert!(px[1] <= 2 && px[2] <= 2, "{:?}", px);
            }
        }
        _ => panic!("expected an image"),
    }
}

/// A 16x16 solid red baseline JPEG built by hand: flat quantization, fixed
/// 8-bit Huffman codes, one DC block per component.
fn jpeg_fixture_solid_red() -> Vec<u8> {
    // (Y, Cb, Cr) for pure red
    let planes = [76u8, 85, 255];
    let mut out = Vec::new();
    out.extend_from_slice(&[0xff, 0xd8]);
    // DQT, table 0, all ones
    out.extend_from_slice(&[0xff, 0xdb, 0x00, 67, 0x00]);
    out.extend_from_slice(&[1u8; 64]);
    // SOF0: 16x16, 3 components, no subsampling
    out.extend_from_slice(&[0xff, 0xc0, 0x00, 17, 8, 0, 16, 0, 16, 3]);
    for id in 1..=3u8 {
        out.extend_from_slice(&[id, 0x11, 0]);
    }
    // DHT DC 0: categories 0..=11 as 8-bit codes
    out.extend_from_slice(&[0xff, 0xc4, 0x00, 31, 0x00]);
    let mut counts = [0u8; 16];
    counts[7] = 12;
    out.extend_from_slice(&counts);
    out.extend((0..12u8).collect::<Vec<_>>());
    // DHT AC 0: EOB plus every (run,size<=12) pair
    let mut values = vec![0x00u8, 0xf0];
    for run in 0..16u8 {
        for size in 1..=12u8 {
            values.push(run << 4 | size);
        }
    }
    let len = 2 + 1 + 16 + values.len() as u16;
    out.extend_from_slice(&[0xff, 0xc4, (len >> 8) as u8, len as u8, 0x10]);
    let mut counts = [0u8; 16];
    counts[7] = values.len() as u8;
    out.extend_from_slice(&counts);
    out.extend_from_slice(&values);
    // SOS
    out.extend_from_slice(&[0xff, 0xda, 0x00, 12, 3, 1, 0, 2, 0, 3, 0, 0, 63, 0]);

    // entropy data: 2x2 MCUs, each holding one DC-only block per component
    let mut bits: Vec<bool> = Vec::new();
    let mut push_code = |bits: &mut Vec<bool>, code: u32, n: u8| {
        for i in (0..n).rev() {
            bits.push(code >> i & 1 == 1);
        }
    };
    let mut predictors = [0i32; 3];
    for _mcu in 0..4 {
        for (c, &v) in planes.iter().enumerate() {
            let dc = (v as i32 - 128) * 8;
            let diff = dc - predictors[c];
            predictors[c] = dc;
            let size = 32 - (diff.unsigned_abs()).leading_zeros() as u8;
            push_code(&mut bits, size as u32, 8);
            if size > 0 {
                let code = if diff < 0 {
                    (diff - 1) as u32 & ((1 << size) - 1)
                } else {
                    diff as u32
                };
                push_code(&mut bits, code, size);
            }
            // EOB
            push_code(&mut bits, 0, 8);
        }
    }
    let mut acc = 0u8;
    let mut n = 0;
    for b in bits {
        acc = acc << 1 | b as u8;
        n += 1;
        if n == 8 {
            out.push(acc);
            if acc == 0xff {
                out.push(0x00);
            }
            acc = 0;
            n = 0;
        }
    }
    if n > 0 {
        acc = (acc << (8 - n)) | ((1 << (8 - n)) - 1);
        out.push(acc);
        if acc == 0xff {
            out.push(0x00);
        }
    }
    out.extend_from_slice(&[0xff, 0xd9]);
    out
}

#[test]
fn s4_rc4_encrypted_content_dispatches() {
    use vellum::crypt::Rc4;

    // the standard handler's padding string
    const PADDING: [u8; 32] = [
        0x28, 0xBF, 0x4E, 0x5E, 0x4E, 0x75, 0x8A, 0x41, 0x64, 0x00, 0x4E, 0x56, 0xFF, 0xFA, 0x01,
        0x08, 0x2E, 0x2E, 0x00, 0xB6, 0xD0, 0x68, 0x3E, 0x80, 0x2F, 0x0C, 0xA9, 0xFE, 0x64, 0x53,
        0x69, 0x7A,
    ];
    let pad = |pass: &[u8]| -> [u8; 32] {
        let mut out = [0u8; 32];
        let n = pass.len().min(32);
        out[..n].copy_from_slice(&pass[..n]);
        out[n..].copy_from_slice(&PADDING[..32 - n]);
        out
    };

    let doc_id: &[u8] = b"\x01\x23\x45\x67\x89\xab\xcd\xef";
    let key_size = 16usize; // /Length 128
    let p: i32 = -4;

    // Algorithm 3: /O from owner password "owner", user password ""
    let mut owner_key = *md5::compute(pad(b"owner"));
    for _ in 0..50 {
        owner_key = *md5::compute(&owner_key[..key_size]);
    }
    let mut o = pad(b"").to_vec();
    for i in 0..20u8 {
        let mut key = [0u8; 16];
        for (k, &b) in key.iter_mut().zip(&owner_key) {
            *k = b ^ i;
        }
        Rc4::encrypt(&key[..key_size], &mut o);
    }

    // Algorithm 2: the file key for the empty user password
    let mut hash = md5::Context::new();
    hash.consume(pad(b""));
    hash.consume(&o);
    hash.consume(p.to_le_bytes());
    hash.consume(doc_id);
    let mut file_key = *hash.compute();
    for _ in 0..50 {
        file_key = *md5::compute(&file_key[..key_size]);
    }

    // Algorithm 5: /U
    let mut hash = md5::Context::new();
    hash.consume(PADDING);
    hash.consume(doc_id);
    let mut u = hash.compute().to_vec();
    Rc4::encrypt(&file_key[..key_size], &mut u);
    for i in 1u8..=19 {
        let mut key = [0u8; 16];
        for (k, &b) in key.iter_mut().zip(&file_key) {
            *k = b ^ i;
        }
        Rc4::encrypt(&key[..key_size], &mut u);
    }

    // Algorithm 1: per-object key for object 4 gen 0
    let mut obj_key_input = file_key[..key_size].to_vec();
    obj_key_input.extend_from_slice(&[4, 0, 0]); // low 3 bytes of the object number
    obj_key_input.extend_from_slice(&[0, 0]); // low 2 bytes of the generation
    let obj_key = *md5::compute(&obj_key_input);

    let contents = b"0.1 0.8 0.1 rg 0 0 612 792 re f";
    let mut encrypted = contents.to_vec();
    Rc4::encrypt(&obj_key[..16], &mut encrypted);

    let o_hex: String = o.iter().map(|b| format!("{:02x}", b)).collect();
    let u_hex: String = u.iter().map(|b| format!("{:02x}", b)).collect();
    let id_hex: String = doc_id.iter().map(|b| format!("{:02x}", b)).collect();

    let pdf = build_pdf(
        &[
            (1, b"<</Type/Catalog/Pages 2 0 R>>".to_vec()),
            (2, b"<</Type/Pages/Kids[3 0 R]/Count 1>>".to_vec()),
            (
                3,
                b"<</Type/Page/Parent 2 0 R/MediaBox[0 0 612 792]/Contents 4 0 R>>".to_vec(),
            ),
            (4, stream_obj("", &encrypted)),
            (
                5,
                format!(
                    "<</Filter/Standard/V 2/R 3/Length 128/P -4/O <{}>/U <{}>>>",
                    o_hex, u_hex
                )
                .into_bytes(),
            ),
        ],
        &format!("/Root 1 0 R/Encrypt 5 0 R/ID[<{}><{}>]", id_hex, id_hex),
    );

    // opens without a password
    let doc = Document::load(pdf, b"").unwrap();
    assert!(doc.is_encrypted());
    let bmp = doc
        .render_page(0, 50, 50, Color::WHITE, RenderFlags::empty())
        .unwrap();
    // the rg fill color was dispatched: page is green-ish
    let px = bmp.get_pixel(25, 25).unwrap();
    assert!(px.g > 180 && px.r < 60 && px.b < 60, "{:?}", px);
}

#[test]
fn s5_circular_references_resolve_bounded() {
    let pdf = build_pdf(
        &[
            (1, b"<</Type/Catalog/Pages 2 0 R>>".to_vec()),
            (2, b"<</Type/Pages/Kids[3 0 R]/Count 1/Extra 6 0 R>>".to_vec()),
            (
                3,
                b"<</Type/Page/Parent 2 0 R/MediaBox[0 0 100 100]>>".to_vec(),
            ),
            (6, b"7 0 R".to_vec()),
            (7, b"6 0 R".to_vec()),
        ],
        "/Root 1 0 R",
    );
    let doc = Document::load(pdf, b"").unwrap();
    // resolving the cycle terminates and yields Null
    let cycle = doc
        .resolve(&vellum::primitive::Primitive::Reference(
            vellum::primitive::PlainRef { id: 6, gen: 0 },
        ))
        .unwrap();
    let end = doc.resolve(&cycle).unwrap();
    assert_eq!(end, vellum::primitive::Primitive::Null);
    // and the document remains usable
    assert_eq!(doc.page_count(), 1);
}

#[test]
fn s6_stream_without_length_renders() {
    // object 4's dictionary lacks /Length entirely
    let contents: &[u8] = b"0 0 0 rg 10 10 80 80 re f";
    let mut body = b"<<>>\nstream\n".to_vec();
    body.extend_from_slice(contents);
    body.extend_from_slice(b"\nendstream");

    let pdf = build_pdf(
        &[
            (1, b"<</Type/Catalog/Pages 2 0 R>>".to_vec()),
            (2, b"<</Type/Pages/Kids[3 0 R]/Count 1>>".to_vec()),
            (
                3,
                b"<</Type/Page/Parent 2 0 R/MediaBox[0 0 100 100]/Contents 4 0 R>>".to_vec(),
            ),
            (4, body),
        ],
        "/Root 1 0 R",
    );
    let doc = Document::load(pdf, b"").unwrap();
    let bmp = doc
        .render_page(0, 100, 100, Color::WHITE, RenderFlags::empty())
        .unwrap();
    let px = bmp.get_pixel(50, 50).unwrap();
    assert_eq!((px.r, px.g, px.b), (0, 0, 0));
    assert!(!doc.warnings().is_empty());
}

#[test]
fn flate_compressed_contents_roundtrip() {
    let contents = b"0 0 1 rg 0 0 50 50 re f";
    let compressed = deflate::deflate_bytes_zlib(contents);
    let pdf = build_pdf(
        &[
            (1, b"<</Type/Catalog/Pages 2 0 R>>".to_vec()),
            (2, b"<</Type/Pages/Kids[3 0 R]/Count 1>>".to_vec()),
            (
                3,
                b"<</Type/Page/Parent 2 0 R/MediaBox[0 0 50 50]/Contents 4 0 R>>".to_vec(),
            ),
            (4, stream_obj("/Filter/FlateDecode", &compressed)),
        ],
        "/Root 1 0 R",
    );
    let doc = Document::load(pdf, b"").unwrap();
    let bmp = doc
        .render_page(0, 50, 50, Color::WHITE, RenderFlags::empty())
        .unwrap();
    let px = bmp.get_pixel(25, 25).unwrap();
    assert_eq!((px.r, px.g, px.b), (0, 0, 255));
}

#[test]
fn metadata_entries_surface() {
    let pdf = build_pdf(
        &[
            (1, b"<</Type/Catalog/Pages 2 0 R>>".to_vec()),
            (2, b"<</Type/Pages/Kids[3 0 R]/Count 1>>".to_vec()),
            (3, b"<</Type/Page/Parent 2 0 R/MediaBox[0 0 10 10]>>".to_vec()),
            (4, b"<</Title(A Title)/Author(An Author)/Producer(vellum)>>".to_vec()),
        ],
        "/Root 1 0 R/Info 4 0 R",
    );
    let doc = Document::load(pdf, b"").unwrap();
    let meta = doc.metadata();
    assert!(meta.contains(&("Title".into(), "A Title".into())));
    assert!(meta.contains(&("Author".into(), "An Author".into())));
}

#[test]
fn rotated_page_swaps_axes() {
    let contents = b"0 0 0 rg 0 0 100 20 re f";
    let pdf = build_pdf(
        &[
            (1, b"<</Type/Catalog/Pages 2 0 R>>".to_vec()),
            (2, b"<</Type/Pages/Kids[3 0 R]/Count 1>>".to_vec()),
            (
                3,
                b"<</Type/Page/Parent 2 0 R/MediaBox[0 0 100 200]/Rotate 90/Contents 4 0 R>>".to_vec(),
            ),
            (4, stream_obj("", contents)),
        ],
        "/Root 1 0 R",
    );
    let doc = Document::load(pdf, b"").unwrap();
    assert_eq!(doc.page_layout(0).unwrap().rotation, 90);
    let bmp = doc
        .render_page(0, 200, 100, Color::WHITE, RenderFlags::empty())
        .unwrap();
    // /Rotate 90 turns the page clockwise: working (x,y)->(y, bw-x) through
    // the device mapping puts the bar along the page bottom (y in 0..20) on
    // the LEFT bitmap columns (x in 0..20), never the right
    let left = bmp.get_pixel(5, 50).unwrap();
    assert!(left.r < 60 && left.g < 60 && left.b < 60, "left edge not painted: {:?}", left);
    let right = bmp.get_pixel(195, 50).unwrap();
    assert!(
        right.r > 200 && right.g > 200 && right.b > 200,
        "right edge should stay background: {:?}",
        right
    );
    // and the stripe spans the full bitmap height
    let top_left = bmp.get_pixel(5, 5).unwrap();
    assert!(top_left.r < 60, "{:?}", top_left);
}
