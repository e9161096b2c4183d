// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

mod arby;

macro_rules! treemap {
    ($($k:expr => $v:expr),*) => {
        {
            let mut m = BTreeMap::new();
            $(m.insert($k, $v);)*
            m
        }
    };
}

mod struct_tests {
    use serde_derive::Deserialize;
    use crate::{from_slice, value_from_slice, DeOptions, Value};

    #[derive(Clone, Debug, PartialEq, Deserialize)]
    struct Inner {
        a: i64,
        b: String,
    }

    #[derive(Clone, Debug, PartialEq, Deserialize)]
    struct Outer {
        inner: Vec<Inner>,
        flag: Option<bool>,
    }

    #[derive(Clone, Debug, PartialEq, Deserialize)]
    enum Animal {
        Dog,
        Frog(i64),
        Cat { age: usize },
    }

    // {'a': 1, 'b': 'hi'}, protocol 2
    const INNER: &[u8] = b"}q\x00(X\x01\x00\x00\x00aK\x01X\x01\x00\x00\x00bX\x02\x00\x00\x00hiu";

    #[test]
    fn decode_struct() {
        let mut pickle = b"\x80\x02".to_vec();
        pickle.extend(INNER);
        pickle.push(b'.');
        let inner: Inner = from_slice(&pickle, DeOptions::new()).unwrap();
        assert_eq!(inner, Inner { a: 1, b: "hi".into() });
    }

    #[test]
    fn decode_nested_struct() {
        // {'inner': [<INNER>], 'flag': None}
        let mut pickle = b"\x80\x02}(X\x05\x00\x00\x00inner]".to_vec();
        pickle.extend(INNER);
        pickle.extend(b"aX\x04\x00\x00\x00flagNu.");
        let outer: Outer = from_slice(&pickle, DeOptions::new()).unwrap();
        assert_eq!(outer, Outer { inner: vec![Inner { a: 1, b: "hi".into() }], flag: None });
    }

    #[test]
    fn decode_enum() {
        let dog: Animal = from_slice(b"\x80\x02X\x03\x00\x00\x00Dog\x85.",
                                     DeOptions::new()).unwrap();
        assert_eq!(dog, Animal::Dog);
        let dog: Animal = from_slice(b"\x80\x02X\x03\x00\x00\x00Dog.", DeOptions::new()).unwrap();
        assert_eq!(dog, Animal::Dog);
        let frog: Animal = from_slice(b"\x80\x02X\x04\x00\x00\x00FrogK\x05\x86.",
                                      DeOptions::new()).unwrap();
        assert_eq!(frog, Animal::Frog(5));
        let frog: Animal = from_slice(b"\x80\x02}X\x04\x00\x00\x00FrogK\x07s.",
                                      DeOptions::new()).unwrap();
        assert_eq!(frog, Animal::Frog(7));
        let cat: Animal = from_slice(b"\x80\x02X\x03\x00\x00\x00Cat}X\x03\x00\x00\x00ageK\x03s\x86.",
                                     DeOptions::new()).unwrap();
        assert_eq!(cat, Animal::Cat { age: 3 });
    }

    #[test]
    fn decode_strings_option() {
        // Protocol 0 strings come out as bytes unless asked otherwise.
        let pickle = b"S'abc'\np0\n.";
        assert_eq!(value_from_slice(pickle, DeOptions::new()).unwrap(),
                   Value::Bytes(b"abc".to_vec()));
        let s: String = from_slice(pickle, DeOptions::new().decode_strings()).unwrap();
        assert_eq!(s, "abc");
    }

    #[test]
    fn decode_into_json() {
        let pickle = b"\x80\x02]q\x00(K\x01G?\xf8\x00\x00\x00\x00\x00\x00\x89Ne.";
        let json: serde_json::Value = from_slice(pickle, DeOptions::new()).unwrap();
        assert_eq!(json, serde_json::json!([1, 1.5, false, null]));
    }
}

mod value_tests {
    use std::collections::{BTreeMap, BTreeSet};
    use std::iter::FromIterator;
    use num_bigint::BigInt;
    use rand::{Rng, thread_rng};
    use crate::{value_from_slice, value_from_reader, value_from_iter, parse_slice,
                infer_version, DeOptions, Constants, Instruction, Source, PyClass};
    use crate::{Value, HashableValue};
    use crate::error::{Error, ErrorCode, Result};

    fn decode(pickle: &[u8]) -> Result<Value> {
        value_from_slice(pickle, DeOptions::new())
    }

    #[test]
    fn protocol4_none() {
        assert_eq!(decode(b"\x80\x04N.").unwrap(), Value::None);
    }

    #[test]
    fn protocol4_true() {
        assert_eq!(decode(b"\x80\x04\x88.").unwrap(), Value::Bool(true));
    }

    #[test]
    fn protocol0_dict() {
        let pickle = b"(dp0\nS'foo'\np1\nS'bar'\np2\ns.";
        assert_eq!(decode(pickle).unwrap(), Value::Dict(treemap!(
            HashableValue::Bytes(b"foo".to_vec()) => Value::Bytes(b"bar".to_vec())
        )));
        assert_eq!(value_from_slice(pickle, DeOptions::new().decode_strings()).unwrap(),
                   Value::Dict(treemap!(
                       HashableValue::String("foo".into()) => Value::String("bar".into())
                   )));
    }

    #[test]
    fn protocol0_scalars() {
        let pickle = b"(I01\nI-12\nL123456789012345678901234567890L\nF2.5\nVa\\u00e9\np0\ng0\nt.";
        let big = BigInt::parse_bytes(b"123456789012345678901234567890", 10).unwrap();
        assert_eq!(decode(pickle).unwrap(), Value::Tuple(vec![
            Value::Bool(true),
            Value::I64(-12),
            Value::Int(big),
            Value::F64(2.5),
            Value::String("a\u{e9}".into()),
            Value::String("a\u{e9}".into()),
        ]));
    }

    #[test]
    fn protocol1_list() {
        // [1, 300, 70000, -1], built with APPENDS
        let pickle = b"]q\x00(K\x01M,\x01J\x70\x11\x01\x00J\xff\xff\xff\xffe.";
        assert_eq!(decode(pickle).unwrap(), Value::List(vec![
            Value::I64(1), Value::I64(300), Value::I64(70000), Value::I64(-1)
        ]));
    }

    #[test]
    fn protocol3_bytes_and_sets() {
        let pickle = b"\x80\x03C\x02ab\x8f(K\x01K\x02\x90\x85.";
        let pickle_v4 = b"\x80\x04\x8f\x94(K\x01K\x02\x90.";
        assert!(decode(pickle).is_err());
        let set = BTreeSet::from_iter(vec![HashableValue::I64(1), HashableValue::I64(2)]);
        assert_eq!(decode(pickle_v4).unwrap(), Value::Set(set));
        assert_eq!(decode(b"\x80\x03C\x02ab.").unwrap(), Value::Bytes(b"ab".to_vec()));
    }

    #[test]
    fn protocol4_frames() {
        // A frame holding [(1, 2)] followed by STOP.
        let body = b"]\x94(K\x01K\x02\x86\x94e.";
        let mut pickle = b"\x80\x04\x95".to_vec();
        pickle.extend(&(body.len() as u64).to_le_bytes());
        pickle.extend(&body[..]);
        assert_eq!(decode(&pickle).unwrap(), Value::List(vec![
            Value::Tuple(vec![Value::I64(1), Value::I64(2)])
        ]));
    }

    #[test]
    fn protocol4_stack_global() {
        let pickle = b"\x80\x04\x8c\x03mod\x94\x8c\x03Cls\x94\x93\x94)\x81\x94}\x94\x8c\x01x\x94K\x01sb.";
        match decode(pickle).unwrap() {
            Value::Object(obj) => {
                assert_eq!(obj.class(), &PyClass::new("mod", "Cls"));
                assert_eq!(obj.getattr("x"), Some(&Value::I64(1)));
            }
            other => panic!("unexpected value {}", other),
        }
    }

    #[test]
    fn unknown_extension() {
        let err = decode(b"\x80\x02\x83\x34\x12.").unwrap_err();
        assert_eq!(err.code(), Some(&ErrorCode::UnknownExtension(0x1234)));
        assert!(err.to_string().contains("4660"));
    }

    #[test]
    fn known_extension() {
        let mut extensions = BTreeMap::new();
        extensions.insert(0x1234, Value::String("registered".into()));
        let value = value_from_slice(b"\x80\x02\x83\x34\x12.",
                                     DeOptions::new().extensions(extensions)).unwrap();
        assert_eq!(value, Value::String("registered".into()));
    }

    #[test]
    fn missing_memo() {
        let err = decode(b"g5\n.").unwrap_err();
        assert_eq!(err.code(), Some(&ErrorCode::MissingMemo(5)));
    }

    #[test]
    fn inference() {
        let mut src = Source::new(&b"K\x01."[..]);
        assert_eq!(infer_version(&mut src).unwrap(), 1);
        assert_eq!(src.pos(), 0);
        assert_eq!(src.read_byte().unwrap(), b'K');

        let mut src = Source::new(&b"\x80\x02N."[..]);
        assert_eq!(infer_version(&mut src).unwrap(), 2);
        assert_eq!(src.pos(), 0);
        assert_eq!(src.read_byte().unwrap(), 0x80);
    }

    #[test]
    fn opcode_outside_version() {
        // NEWTRUE does not exist in protocol 1.
        match decode(b"K\x01\x88.") {
            Err(Error::Format(ErrorCode::UnknownOpcode { opcode: 0x88, version: 1 }, 2)) => { }
            other => panic!("unexpected result {:?}", other),
        }
        // Given explicitly, the version is not inferred.
        assert!(value_from_slice(b"\x88.", DeOptions::new().protocol(1)).is_err());
        assert_eq!(value_from_slice(b"\x88.", DeOptions::new().protocol(2)).unwrap(),
                   Value::Bool(true));
    }

    #[test]
    fn trailing_bytes() {
        let err = decode(b"\x80\x02N.N").unwrap_err();
        assert_eq!(err.code(), Some(&ErrorCode::TrailingBytes));
        assert_eq!(value_from_slice(b"\x80\x02N.N", DeOptions::new().allow_trailing_bytes())
                   .unwrap(), Value::None);
    }

    #[test]
    fn out_of_band_buffers() {
        let pickle = b"\x80\x05\x97\x98.";
        assert_eq!(decode(pickle).unwrap_err().code(), Some(&ErrorCode::MissingBuffers));
        let options = DeOptions::new().buffers(vec![b"abc".to_vec()]);
        match value_from_slice(pickle, options).unwrap() {
            Value::ByteArray(array) => {
                assert_eq!(array.as_bytes(), b"abc");
                assert!(array.is_readonly());
            }
            other => panic!("unexpected value {}", other),
        }
        let options = DeOptions::new().buffers(vec![b"abc".to_vec()]);
        assert_eq!(value_from_slice(b"\x80\x05\x97\x97\x86.", options).unwrap_err().code(),
                   Some(&ErrorCode::BuffersExhausted));
    }

    #[test]
    fn bytearray8() {
        match decode(b"\x80\x05\x96\x03\x00\x00\x00\x00\x00\x00\x00xyz.").unwrap() {
            Value::ByteArray(array) => {
                assert_eq!(array.as_bytes(), b"xyz");
                assert!(!array.is_readonly());
            }
            other => panic!("unexpected value {}", other),
        }
    }

    fn double(args: Vec<Value>, _: BTreeMap<String, Value>) -> Result<Value> {
        match args.first() {
            Some(&Value::I64(i)) if args.len() == 1 => Ok(Value::I64(2 * i)),
            _ => Err(Error::Eval(ErrorCode::InvalidArguments("expected an int".into()), None)),
        }
    }

    #[test]
    fn constants_overlay() {
        let pickle = b"\x80\x02cmath\ndouble\nK\x15\x85R.";
        let mut constants = Constants::empty();
        constants.insert_function("math", "double", double);
        assert_eq!(value_from_slice(pickle, DeOptions::new().constants(constants)).unwrap(),
                   Value::I64(42));
        // Unknown globals are placeholder classes, which are callable.
        match decode(pickle).unwrap() {
            Value::Object(obj) => {
                assert_eq!(obj.class().to_string(), "math.double");
                assert_eq!(obj.args(), &[Value::I64(21)]);
            }
            other => panic!("unexpected value {}", other),
        }
    }

    #[test]
    fn builtin_set() {
        let pickle = b"\x80\x02c__builtin__\nset\n]q\x00(K\x01K\x02K\x01e\x85R.";
        let set = BTreeSet::from_iter(vec![HashableValue::I64(1), HashableValue::I64(2)]);
        assert_eq!(decode(pickle).unwrap(), Value::Set(set));
    }

    #[test]
    fn builtin_bytes() {
        // b"" as pickled by Python 2 under protocols 0, 1 and 2.
        for &pickle in &[&b"c__builtin__\nbytes\np0\n(tRp1\n."[..],
                         &b"c__builtin__\nbytes\nq\x00)Rq\x01."[..],
                         &b"\x80\x02c__builtin__\nbytes\nq\x00)Rq\x01."[..]] {
            assert_eq!(decode(pickle).unwrap(), Value::Bytes(vec![]));
        }
        let pickle = b"\x80\x03cbuiltins\nbytes\n]q\x00(K\x68K\x69e\x85R.";
        assert_eq!(decode(pickle).unwrap(), Value::Bytes(b"hi".to_vec()));
    }

    fn load_upper(id: Value) -> Result<Value> {
        match id {
            Value::String(s) => Ok(Value::String(s.to_uppercase())),
            other => Ok(other),
        }
    }

    #[test]
    fn persistent_ids() {
        assert_eq!(decode(b"Pabc\n.").unwrap_err().code(),
                   Some(&ErrorCode::PersistentLoad("\"abc\"".into())));
        let options = DeOptions::new().persistent_load(load_upper);
        assert_eq!(value_from_slice(b"Pabc\n.", options).unwrap(), Value::String("ABC".into()));
        let options = DeOptions::new().persistent_load(load_upper);
        assert_eq!(value_from_slice(b"X\x02\x00\x00\x00idQ.", options).unwrap(),
                   Value::String("ID".into()));
    }

    #[test]
    fn recursive() {
        for &pickle in &[&b"(lp0\ng0\na."[..], &b"]q\x00h\x00a."[..],
                         &b"\x80\x04]\x94h\x00a."[..]] {
            match decode(pickle) {
                Err(Error::Eval(ErrorCode::Recursive, Some("STOP"))) => { }
                other => panic!("wrong/no error returned for recursive structure: {:?}", other)
            }
        }
    }

    /// Lists nested `depth` levels deep, built by appending each list to
    /// the one below it.
    fn nested_lists(depth: usize) -> Vec<u8> {
        let mut pickle = b"\x80\x02".to_vec();
        pickle.extend(std::iter::repeat(b']').take(depth));
        pickle.extend(std::iter::repeat(b'a').take(depth - 1));
        pickle.push(b'.');
        pickle
    }

    #[test]
    fn deep_nesting() {
        let decoded = decode(&nested_lists(100)).unwrap();
        let mut value = &decoded;
        let mut depth = 1;
        while let Value::List(ref items) = *value {
            match items.first() {
                Some(inner) => { depth += 1; value = inner; }
                None => break,
            }
        }
        assert_eq!(depth, 100);
        for &depth in &[5000, 20000, 50000] {
            match decode(&nested_lists(depth)) {
                Err(Error::Eval(ErrorCode::NestingTooDeep(_), Some("STOP"))) => { }
                other => panic!("unexpected result for depth {}: {:?}", depth, other),
            }
        }
    }

    #[test]
    fn shared_references_are_bounded() {
        // x = None; then x = (x, x) again and again.
        let mut pickle = b"\x80\x02N".to_vec();
        for _ in 0..10 {
            pickle.extend(b"2\x86");
        }
        pickle.push(b'.');
        let mut value = decode(&pickle).unwrap();
        for _ in 0..10 {
            value = match value {
                Value::Tuple(mut items) => {
                    assert_eq!(items.len(), 2);
                    assert_eq!(items[0], items[1]);
                    items.remove(0)
                }
                other => panic!("unexpected value {}", other),
            };
        }
        assert_eq!(value, Value::None);

        let mut pickle = b"\x80\x02N".to_vec();
        for _ in 0..64 {
            pickle.extend(b"2\x86");
        }
        pickle.push(b'.');
        match decode(&pickle) {
            Err(Error::Eval(ErrorCode::TooManyValues(limit), _)) =>
                assert!(limit >= crate::de::MIN_NODES),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn unhashable_keys() {
        for &pickle in &[&b"\x80\x02}]K\x01s."[..], &b"\x80\x04\x8f(]\x90."[..]] {
            match decode(pickle) {
                Err(Error::Eval(ErrorCode::ValueNotHashable, Some("STOP"))) => { }
                other => panic!("unexpected result {:?}", other),
            }
        }
    }

    #[test]
    fn errors_name_the_opcode() {
        let err = decode(b"\x80\x02h\x00.").unwrap_err();
        match err {
            Error::Eval(ErrorCode::MissingMemo(0), Some("BINGET")) => { }
            ref other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(err.to_string(), "deserialization error in BINGET: missing memo with id 0");
        let err = decode(b"\x80\x02\x86.").unwrap_err();
        assert!(err.to_string().contains("TUPLE2"), "{}", err);
        let err = value_from_slice(b"\x80\x05\x97.", DeOptions::new()).unwrap_err();
        assert!(err.to_string().contains("NEXT_BUFFER"), "{}", err);
        let err = decode(b"\x80\x04\x8c\x05ab").unwrap_err();
        assert_eq!(err.code(), Some(&ErrorCode::TruncatedArgument("SHORT_BINUNICODE")));
    }

    #[test]
    fn other_sources() {
        let pickle = b"\x80\x02K\x2a.";
        assert_eq!(value_from_reader(&pickle[..], DeOptions::new()).unwrap(), Value::I64(42));
        assert_eq!(value_from_iter(pickle.iter().cloned(), DeOptions::new()).unwrap(),
                   Value::I64(42));
    }

    #[test]
    fn parse_only() {
        assert_eq!(parse_slice(b"\x80\x02K\x05.", None).unwrap(),
                   vec![Instruction::Proto(2), Instruction::BinInt1(5), Instruction::Stop]);
        assert_eq!(parse_slice(b"K\x05.", Some(1)).unwrap(),
                   vec![Instruction::BinInt1(5), Instruction::Stop]);
        assert!(parse_slice(b"K\x05.", Some(0)).is_err());
    }

    #[test]
    fn fuzzing() {
        // Tries to ensure that we don't panic when encountering strange streams.
        for _ in 0..1000 {
            let mut stream = [0u8; 1000];
            thread_rng().fill(&mut stream[..]);
            if *stream.last().unwrap() == b'.' { continue; }
            // These must all fail with an error, since we skip the check if the
            // last byte is a STOP opcode.
            assert!(decode(&stream).is_err());
        }
    }
}

mod properties {
    use std::collections::BTreeMap;
    use byteorder::{LittleEndian, WriteBytesExt};
    use rand::thread_rng;
    use quickcheck::{QuickCheck, StdGen};
    use crate::{run, value_from_slice, infer_version, DeOptions, Instruction, Source, Value};

    fn quickcheck() -> QuickCheck<StdGen<rand::rngs::ThreadRng>> {
        QuickCheck::new().gen(StdGen::new(thread_rng(), 10)).tests(1000)
    }

    #[test]
    fn memo_roundtrip() {
        fn prop(original: Value, id: u8) -> bool {
            let mut extensions = BTreeMap::new();
            extensions.insert(7, original.clone());
            let program = vec![
                Instruction::Ext4(7),
                Instruction::BinPut(id),
                Instruction::Pop,
                Instruction::BinGet(id),
                Instruction::Stop,
            ];
            run(program.into_iter().map(Ok), DeOptions::new().extensions(extensions)).unwrap()
                == original
        }
        quickcheck().quickcheck(prop as fn(_, _) -> bool);
    }

    #[test]
    fn mark_brackets() {
        fn prop(items: Vec<i32>) -> bool {
            let mut program = vec![Instruction::Mark];
            program.extend(items.iter().map(|&i| Instruction::BinInt(i)));
            program.push(Instruction::Tuple);
            program.push(Instruction::Stop);
            let expected = items.iter().map(|&i| Value::I64(i as i64)).collect();
            run(program.into_iter().map(Ok), DeOptions::new()).unwrap() == Value::Tuple(expected)
        }
        quickcheck().quickcheck(prop as fn(_) -> bool);
    }

    #[test]
    fn text_integers() {
        assert_eq!(value_from_slice(b"I01\n.", DeOptions::new()).unwrap(), Value::Bool(true));
        assert_eq!(value_from_slice(b"I00\n.", DeOptions::new()).unwrap(), Value::Bool(false));
        fn prop(n: i64) -> bool {
            let pickle = format!("I{}\n.", n);
            value_from_slice(pickle.as_bytes(), DeOptions::new()).unwrap() == Value::I64(n)
        }
        quickcheck().quickcheck(prop as fn(_) -> bool);
    }

    #[test]
    fn frame_transparency() {
        fn binint(items: &[i32]) -> Vec<u8> {
            let mut buf = Vec::new();
            for &i in items {
                buf.push(b'J');
                buf.write_i32::<LittleEndian>(i).unwrap();
            }
            buf
        }
        fn frame(body: &[u8]) -> Vec<u8> {
            let mut buf = vec![0x95];
            buf.write_u64::<LittleEndian>(body.len() as u64).unwrap();
            buf.extend(body);
            buf
        }
        fn prop(items: Vec<i32>, split: usize) -> bool {
            let split = split % (items.len() + 1);
            let mut first = b"(".to_vec();
            first.extend(binint(&items[..split]));
            let mut second = binint(&items[split..]);
            second.extend(b"l.");

            let mut plain = b"\x80\x04".to_vec();
            plain.extend(&first);
            plain.extend(&second);
            let mut framed = b"\x80\x04".to_vec();
            framed.extend(frame(&first));
            framed.extend(frame(&second));

            value_from_slice(&plain, DeOptions::new()).unwrap() ==
                value_from_slice(&framed, DeOptions::new()).unwrap()
        }
        quickcheck().quickcheck(prop as fn(_, _) -> bool);
    }

    #[test]
    fn inference_restores_input() {
        fn prop(bytes: Vec<u8>) -> bool {
            let mut src = Source::new(&bytes[..]);
            let _ = infer_version(&mut src);
            if src.pos() != 0 {
                return false;
            }
            let mut read = Vec::new();
            while let Ok(Some(byte)) = src.next_byte() {
                read.push(byte);
            }
            read == bytes
        }
        quickcheck().quickcheck(prop as fn(_) -> bool);
    }
}
